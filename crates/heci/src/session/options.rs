//! Connect options.

use serde::{Deserialize, Serialize};

/// Write flow-control discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Queued writes transfer back-to-back, independent of reads.
    #[default]
    Pipelined,
    /// A completed write is retired only when the next inbound message is
    /// delivered, so at most one write completes between two reads.
    ReadGated,
}

/// Options supplied with [`Session::connect`](crate::Session::connect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Write flow-control discipline for the connection.
    pub write_mode: WriteMode,
}

impl ConnectOptions {
    /// Options selecting read-gated writes.
    pub fn read_gated() -> Self {
        Self {
            write_mode: WriteMode::ReadGated,
        }
    }

    /// Returns these options with `write_mode` replaced.
    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_pipelined() {
        assert_eq!(ConnectOptions::default().write_mode, WriteMode::Pipelined);
    }

    #[test]
    fn test_read_gated_constructor() {
        assert_eq!(ConnectOptions::read_gated().write_mode, WriteMode::ReadGated);
        assert_eq!(
            ConnectOptions::read_gated().with_write_mode(WriteMode::Pipelined),
            ConnectOptions::default()
        );
    }

    #[test]
    fn test_write_mode_names() {
        let opts: ConnectOptions = toml::from_str("write_mode = \"read-gated\"").unwrap();
        assert_eq!(opts.write_mode, WriteMode::ReadGated);

        let opts: ConnectOptions = toml::from_str("").unwrap();
        assert_eq!(opts.write_mode, WriteMode::Pipelined);

        assert!(toml::from_str::<ConnectOptions>("write_mode = \"lockstep\"").is_err());
    }
}
