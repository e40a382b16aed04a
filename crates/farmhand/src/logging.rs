use tracing::{debug, error, info, trace, warn};

use farmhand_proto::{LogEnvelope, LogLevel};

use crate::error::{Error, Result};

/// Replay a worker log envelope onto the parent logger. Every level carries
/// a textual message; anything else is a protocol violation.
pub(crate) fn replay(envelope: &LogEnvelope) -> Result<()> {
    let Some(message) = envelope.message.as_str() else {
        return Err(Error::operation(
            "forward log event",
            format!("non-string message for {:?} level", envelope.level),
        ));
    };

    match envelope.level {
        LogLevel::Info => info!("{message}"),
        LogLevel::Progress => trace!("{message}"),
        LogLevel::Verbose => debug!("{message}"),
        LogLevel::Warn => warn!("{message}"),
        LogLevel::Error => error!("{message}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn string_messages_replay_cleanly() {
        for level in [
            LogLevel::Info,
            LogLevel::Progress,
            LogLevel::Verbose,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            let envelope = LogEnvelope {
                level,
                message: json!("worker said something"),
            };
            replay(&envelope).expect("string message must replay");
        }
    }

    #[test]
    fn non_string_message_is_rejected() {
        let envelope = LogEnvelope {
            level: LogLevel::Info,
            message: json!({"not": "a string"}),
        };
        let err = replay(&envelope).expect_err("must fail loudly");
        assert!(err.to_string().contains("non-string message"));
    }
}
