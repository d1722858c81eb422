//! Mint and inspect opaque relay links.

use clap::{Parser, Subcommand, ValueEnum};
use hls_relay::hls::{LinkBuilder, ReferenceRole};
use hls_relay::token;
use std::io::{self, Write};
use std::process::ExitCode;
use url::Url;

#[derive(Parser)]
#[command(name = "relay-token")]
#[command(about = "Encode and decode hls-relay opaque tokens")]
#[command(version)]
struct Cli {
    /// 32-byte secret key (defaults to SECRET_KEY)
    #[arg(short, long, env = "SECRET_KEY", hide_env_values = true)]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an opaque /video link for a target URL
    Encode {
        /// Absolute upstream URL
        #[arg(short, long)]
        url: String,

        /// Referer to present when fetching the target
        #[arg(short, long)]
        referer: Option<String>,

        /// What the target is
        #[arg(long, value_enum, default_value = "playlist")]
        role: Role,

        /// Public base URL of the relay
        #[arg(short, long, default_value = "")]
        base: String,
    },

    /// Print the JSON payload carried by a token
    Decode {
        /// Token, the last path segment of a /video link
        token: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Playlist,
    Segment,
    Key,
}

impl From<Role> for ReferenceRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Playlist => ReferenceRole::SubPlaylist,
            Role::Segment => ReferenceRole::Segment,
            Role::Key => ReferenceRole::Key,
        }
    }
}

fn run(cli: Cli) -> Result<String, Box<dyn std::error::Error>> {
    let key = cli.key.as_bytes();
    match cli.command {
        Commands::Encode {
            url,
            referer,
            role,
            base,
        } => {
            let target = Url::parse(&url)?;
            if let Some(referer) = &referer {
                Url::parse(referer)?;
            }
            let base = base.trim_end_matches('/');
            let links = LinkBuilder::tokenized(base, key);
            Ok(links.build(&target, role.into(), referer.as_deref())?)
        }
        Commands::Decode { token: raw } => {
            let payload = token::decode_payload(raw.trim(), key)?;
            Ok(serde_json::to_string_pretty(&payload)?)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(out) => {
            let _ = writeln!(io::stdout().lock(), "{out}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let _ = writeln!(io::stderr().lock(), "error: {e}");
            ExitCode::FAILURE
        }
    }
}
