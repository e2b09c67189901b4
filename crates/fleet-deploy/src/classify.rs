use crate::remote_text::strip_xtrace_lines;
use crate::state::RunState;

pub const CDK_FAILURE_SENTINEL: &str = "cdk_pipe.sh 执行失败";
pub const COMPLETION_SENTINEL: &str = "所有步骤完成";

/// Infers the terminal state of a finished workload from its log text.
pub trait LogClassifier: Send + Sync {
    fn classify(&self, text: &str) -> (RunState, String);
}

/// Pipelines that print both an explicit failure line and a completion line.
#[derive(Debug, Clone, Copy)]
pub struct Structured {
    pub failure: &'static str,
    pub success: &'static str,
}

impl LogClassifier for Structured {
    fn classify(&self, text: &str) -> (RunState, String) {
        if text.contains(self.failure) {
            return (
                RunState::Failed,
                format!("log contains failure marker '{}'", self.failure),
            );
        }
        if text.contains(self.success) {
            return (RunState::Success, String::new());
        }
        (
            RunState::Unknown,
            "process exited without a failure or completion marker".into(),
        )
    }
}

/// Anything that did not print the completion line counts as failed.
#[derive(Debug, Clone, Copy)]
pub struct CompletionSentinel {
    pub success: &'static str,
}

impl LogClassifier for CompletionSentinel {
    fn classify(&self, text: &str) -> (RunState, String) {
        if text.contains(self.success) {
            (RunState::Success, String::new())
        } else {
            (
                RunState::Failed,
                format!("process exited without completion marker '{}'", self.success),
            )
        }
    }
}

static STRUCTURED: Structured = Structured {
    failure: CDK_FAILURE_SENTINEL,
    success: COMPLETION_SENTINEL,
};

static COMPLETION: CompletionSentinel = CompletionSentinel {
    success: COMPLETION_SENTINEL,
};

pub fn classifier_for(role: &str) -> &'static dyn LogClassifier {
    if role.to_ascii_lowercase().contains("cdk") {
        &STRUCTURED
    } else {
        &COMPLETION
    }
}

/// Classify the newest log text of a workload whose process has exited.
pub fn classify(role: &str, text: &str) -> (RunState, String) {
    classifier_for(role).classify(&strip_xtrace_lines(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_marker_beats_earlier_completion() {
        let log = format!("step 1\n{COMPLETION_SENTINEL}\nretry\n{CDK_FAILURE_SENTINEL}\n");
        let (state, reason) = classify("cdk", &log);
        assert_eq!(state, RunState::Failed);
        assert!(reason.contains(CDK_FAILURE_SENTINEL));
    }

    #[test]
    fn structured_without_markers_is_unknown() {
        assert_eq!(classify("cdk", "deploying...\nbye\n").0, RunState::Unknown);
        assert_eq!(
            classify("cdk", &format!("{COMPLETION_SENTINEL}\n")).0,
            RunState::Success
        );
    }

    #[test]
    fn other_roles_need_completion_marker() {
        assert_eq!(
            classify("op", &format!("x\n{COMPLETION_SENTINEL}")).0,
            RunState::Success
        );
        assert_eq!(classify("xjst", "crashed").0, RunState::Failed);
    }

    #[test]
    fn xtrace_echo_does_not_count() {
        let log = format!("+ echo {COMPLETION_SENTINEL}\nKilled\n");
        assert_eq!(classify("op", &log).0, RunState::Failed);
        let log = format!("++ echo '{CDK_FAILURE_SENTINEL}'\n{COMPLETION_SENTINEL}\n");
        assert_eq!(classify("cdk", &log).0, RunState::Success);
    }
}
