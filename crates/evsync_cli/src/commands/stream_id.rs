//! Stream-id command implementation.

use clap::Subcommand;
use evsync_protocol::SyncStreamId;
use serde::Serialize;

/// Stream selected on the command line.
#[derive(Debug, Clone, Subcommand)]
pub enum StreamArgs {
    /// Core account stream of a user
    Core {
        /// User id
        user: String,
    },

    /// Calendar stream of a user
    Calendar {
        /// User id
        user: String,
        /// Calendar id
        calendar: String,
        /// Calendar API version
        #[arg(long, default_value_t = 1)]
        api_version: u32,
    },

    /// Shared drive volume stream of a user
    Drive {
        /// User id
        user: String,
        /// Share id
        share: String,
    },

    /// Parse an existing stream key
    Parse {
        /// Stream key, e.g. `calendar:u1:cal:1`
        key: String,
    },
}

impl StreamArgs {
    /// Builds the stream id.
    pub fn to_stream(&self) -> Result<SyncStreamId, Box<dyn std::error::Error>> {
        let stream = match self {
            StreamArgs::Core { user } => SyncStreamId::core(user.as_str()),
            StreamArgs::Calendar {
                user,
                calendar,
                api_version,
            } => SyncStreamId::calendar(user.as_str(), calendar.as_str(), *api_version),
            StreamArgs::Drive { user, share } => SyncStreamId::drive(user.as_str(), share.as_str()),
            StreamArgs::Parse { key } => key.parse()?,
        };
        Ok(stream)
    }
}

/// Stream description.
#[derive(Debug, Serialize)]
pub struct StreamIdResult {
    /// Checkpoint key and job name.
    pub key: String,
    /// Stream kind.
    pub kind: String,
    /// Owning user.
    pub user: String,
    /// Job tags.
    pub tags: Vec<String>,
}

impl From<&SyncStreamId> for StreamIdResult {
    fn from(stream: &SyncStreamId) -> Self {
        Self {
            key: stream.key(),
            kind: stream.kind().as_str().to_string(),
            user: stream.user_id().to_string(),
            tags: stream.tags().to_vec(),
        }
    }
}

/// Runs the stream-id command.
pub fn run(args: &StreamArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stream = args.to_stream()?;
    let result = StreamIdResult::from(&stream);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("key:  {}", result.key);
            println!("kind: {}", result.kind);
            println!("user: {}", result.user);
            println!("tags: {}", result.tags.join(", "));
        }
    }

    Ok(())
}
