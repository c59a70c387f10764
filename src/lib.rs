// Library root
// -----------
// The binary (`main.rs`) is a thin wrapper; everything it does lives here
// so the stream consumer and the upload pipeline can be driven from tests
// with a scripted gateway instead of the network.
//
// Module responsibilities:
// - `api`: HTTP gateway trait, the reqwest-backed client, API error and
//   rate-limit mapping.
// - `config`: layered settings (defaults, config file, env, flags).
// - `cancel`: cooperative cancellation shared by long-running operations.
// - `stream`: filtered-stream reader, reconnect loop and rule management.
// - `media`: chunked media upload (INIT, APPEND, FINALIZE, STATUS).
// - `ui`: terminal output, prompts and progress bars.
// - `cli`: clap commands wiring the pieces together.
pub mod api;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod logging;
pub mod media;
pub mod stream;
pub mod ui;
