// Command line surface: clap definitions plus the two commands that drive
// the core, `watch` (stream consumer) and `media upload` (upload pipeline).
// Flags are the last configuration layer and are applied here on top of
// `Config::resolve`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use crate::api::{ApiClient, Query};
use crate::cancel::{self, CancelToken};
use crate::config::Config;
use crate::media::{MediaCategory, MediaUploader};
use crate::stream::rules::{self, NewRule};
use crate::stream::StreamConsumer;
use crate::ui::{self, OutputMode, TweetPrinter, UploadBar};

const DEFAULT_TWEET_FIELDS: &str = "created_at,author_id,lang,possibly_sensitive,source";

#[derive(Debug, Parser)]
#[command(name = "ctw", version, about = "Twitter v2 command line client")]
pub struct Cli {
    /// API bearer token (defaults to BEARER_TOKEN)
    #[arg(long, global = true)]
    pub bearer_token: Option<String>,

    /// Override the API base URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Override the HTTP User-Agent header
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    /// Path to the config file (defaults to ~/.config/ctw/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// HTTP timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Watch tweets matching keywords in real time (Ctrl+C to stop)
    Watch(WatchArgs),
    /// Media operations
    #[command(subcommand)]
    Media(MediaCommand),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Keyword to watch for (repeatable)
    #[arg(long = "keyword", required = true)]
    pub keywords: Vec<String>,

    /// Replace the stream rules with one rule per keyword
    #[arg(long)]
    pub auto_setup: bool,

    /// Do not ask before deleting existing rules
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Show author information
    #[arg(long)]
    pub show_user: bool,

    /// Show additional metadata
    #[arg(long)]
    pub show_meta: bool,

    /// Output newline-delimited JSON events
    #[arg(long)]
    pub json: bool,

    /// Extra query parameter for the stream request (key=value, repeatable)
    #[arg(long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, String)>,

    /// Stop after this many tweets
    #[arg(long)]
    pub max_events: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum MediaCommand {
    /// Upload an image or video with the chunked upload API
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Path to the media file
    #[arg(long)]
    pub file: PathBuf,

    /// Media category (tweet_image, tweet_video, tweet_gif, dm_image, dm_video, dm_gif)
    #[arg(long, value_parser = parse_category)]
    pub category: Option<MediaCategory>,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn parse_category(raw: &str) -> Result<MediaCategory, String> {
    raw.parse()
}

impl Cli {
    /// Apply command line overrides, the last configuration layer.
    pub fn apply_to(&self, config: &mut Config) {
        let set = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        if let Some(token) = set(&self.bearer_token) {
            config.bearer_token = Some(token);
        }
        if let Some(url) = set(&self.base_url) {
            config.base_url = url;
        }
        if let Some(agent) = set(&self.user_agent) {
            config.user_agent = agent;
        }
        if let Some(secs) = self.timeout.filter(|s| *s > 0) {
            config.timeout = Duration::from_secs(secs);
        }
        if self.pretty {
            config.pretty = true;
        }
    }
}

/// Resolve configuration and run the selected command.
pub fn execute(cli: Cli) -> Result<()> {
    let mut config = Config::resolve(cli.config.as_deref())?;
    cli.apply_to(&mut config);

    let cancel = CancelToken::new();
    cancel::install_interrupt_handler(cancel.clone())
        .context("Failed to install Ctrl+C handler")?;

    let client = ApiClient::new(&config).context("Failed to build HTTP client")?;

    match cli.command {
        Command::Watch(args) => watch(&client, &config, cancel, args),
        Command::Media(MediaCommand::Upload(args)) => upload(&client, &config, cancel, args),
    }
}

/// Stream query parameters for `watch`.
pub fn stream_fields(args: &WatchArgs) -> Query {
    let mut fields = Query::new();
    fields.insert("tweet.fields".into(), DEFAULT_TWEET_FIELDS.into());
    if args.show_user {
        fields.insert("expansions".into(), "author_id".into());
        fields.insert("user.fields".into(), "name,username,created_at".into());
    }
    // Explicit --field values win over the defaults above.
    for (key, value) in &args.fields {
        fields.insert(key.clone(), value.clone());
    }
    fields
}

fn watch(client: &ApiClient, config: &Config, cancel: CancelToken, args: WatchArgs) -> Result<()> {
    let ruleset = if args.auto_setup {
        setup_rules(client, &args.keywords, args.yes)?;
        args.keywords.join(", ")
    } else {
        "existing rules".to_string()
    };

    let fields = stream_fields(&args);
    let mode = match (args.json, config.pretty) {
        (true, true) => OutputMode::PrettyJson {
            show_user: args.show_user,
        },
        (true, false) => OutputMode::Json,
        (false, _) => OutputMode::Human {
            show_user: args.show_user,
            show_meta: args.show_meta,
        },
    };

    eprintln!("\nWatching for keywords: {}", args.keywords.join(", "));
    eprintln!("Press Ctrl+C to stop\n");

    let mut printer = TweetPrinter::stdout(mode, args.max_events);
    let mut consumer =
        StreamConsumer::new(client, &config.stream, cancel).on_disconnect(ui::print_disconnect);
    let stats = consumer
        .run(&fields, &mut printer)
        .context("Stream stopped with an error")?;

    ui::print_summary(&stats, &ruleset);
    Ok(())
}

/// Replace the current stream rules with one rule per keyword.
fn setup_rules(client: &ApiClient, keywords: &[String], yes: bool) -> Result<()> {
    eprintln!("Setting up stream rules...");

    let existing = rules::list_rules(client).context("failed to get existing rules")?;
    if !existing.is_empty() {
        for rule in &existing {
            eprintln!("   existing: {} (ID: {})", rule.value, rule.id);
        }
        let prompt = format!("Delete {} existing rule(s)?", existing.len());
        if yes || ui::confirm(&prompt)? {
            let ids: Vec<String> = existing.into_iter().map(|r| r.id).collect();
            // Stale rules only widen the feed, so keep going if this fails.
            if let Err(e) = rules::delete_rules(client, &ids) {
                eprintln!("Warning: failed to delete existing rules: {e}");
            }
        } else {
            eprintln!("Keeping existing rules");
        }
    }

    let new_rules: Vec<NewRule> = keywords.iter().map(|k| NewRule::for_keyword(k)).collect();
    let added = rules::add_rules(client, &new_rules, false).context("failed to add rules")?;
    eprintln!("Added {} rule(s)", added.len());
    for rule in &added {
        eprintln!("   - {} (ID: {})", rule.value, rule.id);
    }
    Ok(())
}

fn upload(client: &ApiClient, config: &Config, cancel: CancelToken, args: UploadArgs) -> Result<()> {
    if !args.file.is_file() {
        bail!("file does not exist: {}", args.file.display());
    }
    let total = std::fs::metadata(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?
        .len();

    let mut bar = UploadBar::new(total);
    let uploader = MediaUploader::new(client, config, cancel);
    let media_id = match uploader.upload_file_with_progress(&args.file, args.category, &mut bar) {
        Ok(id) => {
            bar.finish("uploaded");
            id
        }
        Err(e) => {
            bar.abandon();
            return Err(e).context("upload failed");
        }
    };

    let result = json!({
        "media_id_string": media_id,
        "status": "uploaded",
    });
    let text = if config.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{text}");
    eprintln!("Media uploaded successfully. Use media_id_string in tweets/DMs.");
    Ok(())
}
