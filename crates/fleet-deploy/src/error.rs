use std::fmt;

#[derive(Debug)]
pub struct Error {
    msg: String,
    cancelled: bool,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            msg: msg.into(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            msg: "cancelled".into(),
            cancelled: true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Prefix the message with context, keeping the cancellation marker.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            msg: format!("{ctx}: {}", self.msg),
            cancelled: self.cancelled,
        }
    }

    // One line per failing instance, under a count header.
    pub fn aggregate(failures: &[InstanceFailure]) -> Self {
        let mut body = format!("{} instance(s) failed:", failures.len());
        for f in failures {
            body.push_str("\n- ");
            body.push_str(&f.to_string());
        }
        Self::msg(body)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A per-instance failure collected during a fan-out phase.
#[derive(Debug, Clone)]
pub struct InstanceFailure {
    pub address: String,
    pub name: Option<String>,
    pub cause: String,
}

impl fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => write!(f, "[{}][{}] {}", self.address, name, self.cause),
            None => write!(f, "[{}] {}", self.address, self.cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_one_line_per_instance() {
        let err = Error::aggregate(&[
            InstanceFailure {
                address: "10.0.0.2".into(),
                name: Some("ydyl-op-2".into()),
                cause: "boom".into(),
            },
            InstanceFailure {
                address: "10.0.0.4".into(),
                name: None,
                cause: "bang".into(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "2 instance(s) failed:\n- [10.0.0.2][ydyl-op-2] boom\n- [10.0.0.4] bang"
        );
    }

    #[test]
    fn context_keeps_cancel_marker() {
        let err = Error::cancelled().context("wait ssh");
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "wait ssh: cancelled");
    }
}
