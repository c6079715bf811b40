#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod channels;
pub mod config;
pub mod doctor;
pub mod gateway;
pub mod quota;
pub mod reasoning;
pub mod security;
pub mod store;
pub mod tenancy;
pub mod util;

pub use config::Config;

/// Channel management subcommands.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelCommands {
    /// List every channel connected for a tenant
    List {
        /// Tenant id
        #[arg(long)]
        tenant: String,
    },
    /// Connect a channel after probing the platform credential
    #[command(long_about = "\
Connect a channel after probing the platform credential.

The secret is the channel credential: the mailbox password for email,
the bot token for bot channels, or the platform access token for
business messaging. The credential is verified against the platform,
sealed, and only then stored. Endpoint settings are a JSON object.

Examples:
  trunkline channel add --tenant acme bot '123456:ABC-DEF'
  trunkline channel add --tenant acme business 'EAAG...' \\
    '{\"phone_number_id\":\"1031\",\"verify_token\":\"hook-token\"}'
  trunkline channel add --tenant acme email 'mailbox-pass' \\
    '{\"imap_host\":\"imap.example.com\",\"address\":\"support@acme.com\"}'")]
    Add {
        /// Tenant id
        #[arg(long)]
        tenant: String,
        /// Channel type (email, bot, business)
        channel_type: String,
        /// Channel credential
        secret: String,
        /// Endpoint settings as a JSON object
        #[arg(default_value = "{}")]
        endpoint: String,
    },
    /// Disconnect a channel and deregister its platform callback
    Remove {
        /// Tenant id
        #[arg(long)]
        tenant: String,
        /// Channel type (email, bot, business)
        channel_type: String,
    },
    /// Show one channel's connection state as JSON
    Status {
        /// Tenant id
        #[arg(long)]
        tenant: String,
        /// Channel type (email, bot, business)
        channel_type: String,
    },
}
