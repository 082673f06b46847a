/// Text-backed enum columns: `as_str`, `FromStr` and `Display` share one table.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::MarketError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::MarketError::InvalidState(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod backend;
pub mod changes;
pub mod config;
pub mod context;
pub mod db;
pub mod encryption;
pub mod error;
pub mod memory;
pub mod pg;
pub mod redis;
pub mod redpanda;
pub mod schema;
pub mod types;

pub use backend::MarketBackend;
pub use changes::{ChangeEvent, ChangeFilter, ChangeKind, Table};
pub use config::Config;
pub use context::MarketContext;
pub use db::DbPool;
pub use encryption::{decrypt_message, encrypt_message};
pub use error::{FieldError, MarketError, MarketResult, ValidationErrors};
pub use memory::MemoryBackend;
pub use pg::PgBackend;
pub use redis::RedisPool;
pub use redpanda::{RedpandaConsumer, RedpandaProducer};
