// UI layer: everything the user sees on the terminal. Tweets go to
// stdout (human text or NDJSON), progress and notices go to stderr so the
// JSON output can be piped into other tools.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::media::{Phase, ProcessingState, UploadProgress, UploadSession};
use crate::stream::{DisconnectNotice, EventHandler, Flow, Includes, SessionStats, Tweet};

/// How `watch` renders each tweet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human { show_user: bool, show_meta: bool },
    /// `{data, includes}` per line.
    Json,
    /// Flattened one-object-per-tweet JSON, indented.
    PrettyJson { show_user: bool },
}

/// `EventHandler` that prints tweets. Stops cleanly once `limit` tweets
/// were printed or when stdout is closed (e.g. piped into `head`).
pub struct TweetPrinter<W: Write> {
    out: W,
    mode: OutputMode,
    count: u64,
    limit: Option<u64>,
}

impl TweetPrinter<io::Stdout> {
    pub fn stdout(mode: OutputMode, limit: Option<u64>) -> Self {
        TweetPrinter::new(io::stdout(), mode, limit)
    }
}

impl<W: Write> TweetPrinter<W> {
    pub fn new(out: W, mode: OutputMode, limit: Option<u64>) -> Self {
        TweetPrinter {
            out,
            mode,
            count: 0,
            limit,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_tweet(&mut self, tweet: &Tweet, includes: &Includes) -> io::Result<()> {
        match self.mode {
            OutputMode::Json => {
                #[derive(Serialize)]
                struct RawEvent<'a> {
                    data: &'a Tweet,
                    #[serde(skip_serializing_if = "no_includes")]
                    includes: &'a Includes,
                }
                let line = serde_json::to_string(&RawEvent {
                    data: tweet,
                    includes,
                })?;
                writeln!(self.out, "{line}")?;
            }
            OutputMode::PrettyJson { show_user } => {
                let author = includes.author_of(tweet).filter(|_| show_user);
                let flat = FlatTweet {
                    id: &tweet.id,
                    text: &tweet.text,
                    author_id: tweet.author_id.as_deref(),
                    author_username: author.map(|u| u.username.as_str()),
                    author_name: author.map(|u| u.name.as_str()),
                    created_at: tweet.created_at,
                    lang: tweet.lang.as_deref(),
                    source: tweet.source.as_deref(),
                    possibly_sensitive: tweet.possibly_sensitive,
                };
                let text = serde_json::to_string_pretty(&flat)?;
                writeln!(self.out, "{text}")?;
            }
            OutputMode::Human {
                show_user,
                show_meta,
            } => self.write_human(tweet, includes, show_user, show_meta)?,
        }
        self.out.flush()
    }

    fn write_human(
        &mut self,
        tweet: &Tweet,
        includes: &Includes,
        show_user: bool,
        show_meta: bool,
    ) -> io::Result<()> {
        let out = &mut self.out;
        writeln!(out, "\n{}", "─".repeat(41).dark_grey())?;
        writeln!(out, "{}", format!("Tweet #{}", self.count).bold().cyan())?;
        writeln!(out, "ID: {}", tweet.id)?;
        if let Some(created) = tweet.created_at {
            writeln!(out, "Time: {}", created.to_rfc3339())?;
        }
        match includes.author_of(tweet).filter(|_| show_user) {
            Some(user) => writeln!(out, "Author: @{} ({})", user.username.as_str().green(), user.name)?,
            None => writeln!(out, "Author ID: {}", tweet.author_id.as_deref().unwrap_or("-"))?,
        }
        if let Some(lang) = &tweet.lang {
            writeln!(out, "Language: {lang}")?;
        }
        if tweet.possibly_sensitive {
            writeln!(out, "{}", "Possibly sensitive".yellow())?;
        }
        writeln!(out, "\nText:\n{}", tweet.text)?;
        if show_meta {
            writeln!(out, "\nMetadata:")?;
            writeln!(out, "  Source: {}", tweet.source.as_deref().unwrap_or("-"))?;
        }
        Ok(())
    }
}

fn no_includes(includes: &&Includes) -> bool {
    includes.is_empty()
}

#[derive(Serialize)]
struct FlatTweet<'a> {
    id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lang: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    possibly_sensitive: bool,
}

impl<W: Write> EventHandler for TweetPrinter<W> {
    fn on_event(&mut self, tweet: &Tweet, includes: &Includes) -> Result<Flow> {
        self.count += 1;
        match self.write_tweet(tweet, includes) {
            Ok(()) => {}
            // Nobody is reading any more; that is a clean stop, not a failure.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(Flow::Stop),
            Err(e) => return Err(e.into()),
        }
        match self.limit {
            Some(limit) if self.count >= limit => Ok(Flow::Stop),
            _ => Ok(Flow::Continue),
        }
    }
}

/// Ask a yes/no question on the terminal.
pub fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

/// Reconnect notice shown while the stream keeps going.
pub fn print_disconnect(notice: &DisconnectNotice) {
    eprintln!(
        "{} {} (attempt {}), reconnecting in {}...",
        "disconnected:".yellow(),
        notice.reason,
        notice.attempt,
        format_duration(notice.wait)
    );
}

/// Final statistics of a `watch` session.
pub fn print_summary(stats: &SessionStats, ruleset: &str) {
    eprintln!(
        "\n\nStream summary: {}, {} tweets, reconnects={}, last_disconnect={}, last_ruleset={}",
        format_duration(stats.elapsed),
        stats.events,
        stats.reconnects,
        stats.last_disconnect.as_deref().unwrap_or("none"),
        ruleset
    );
    if stats.malformed > 0 {
        eprintln!("Skipped {} malformed line(s)", stats.malformed);
    }
    if !stats.elapsed.is_zero() {
        eprintln!("Rate: {:.1} tweets/minute", stats.events_per_minute());
    }
}

/// Whole seconds, e.g. `1m 05s` or `42s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// indicatif progress bar for the upload pipeline.
pub struct UploadBar {
    bar: ProgressBar,
}

impl UploadBar {
    pub fn new(total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        let style = ProgressStyle::with_template(
            "{spinner} {msg:10} [{bar:30.cyan/blue}] {bytes}/{total_bytes}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("=> "));
        bar.enable_steady_tick(Duration::from_millis(120));
        UploadBar { bar }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl UploadProgress for UploadBar {
    fn phase_started(&mut self, phase: Phase) {
        self.bar.set_message(phase.to_string());
    }

    fn segment_sent(&mut self, session: &UploadSession) {
        self.bar.set_position(session.bytes_sent());
    }

    fn processing(&mut self, state: ProcessingState, percent: Option<u8>) {
        let label = match state {
            ProcessingState::Pending => "pending",
            ProcessingState::InProgress => "processing",
            ProcessingState::Succeeded => "processed",
            ProcessingState::Failed => "failed",
        };
        match percent {
            Some(p) => self.bar.set_message(format!("{label} {p}%")),
            None => self.bar.set_message(label),
        }
    }
}
