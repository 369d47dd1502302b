//! World lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a world.
///
/// ```text
/// absent -> creating -> created -> starting -> running -> (authenticated)
///        -> stopping -> stopped -> absent
/// ```
///
/// `error` is reachable from any active state and a stopped or failed world
/// can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Absent,
    Creating,
    Created,
    Starting,
    Running,
    Authenticated,
    Stopping,
    Stopped,
    Error,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Authenticated => "authenticated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// The server process is up (or coming up) and can be stopped.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Authenticated)
    }

    /// The server accepts console commands.
    pub const fn accepts_commands(self) -> bool {
        matches!(self, Self::Running | Self::Authenticated)
    }

    /// The server is down after having been started.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// The world can be started from this status.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Error)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use Status::{
            Absent, Authenticated, Created, Creating, Error, Running, Starting, Stopped, Stopping,
        };

        match (self, next) {
            // delete
            (Absent, _) => matches!(next, Creating | Created),
            (_, Absent) => true,
            (Creating, Created | Error) => true,
            (Created | Stopped | Error, Starting) => true,
            (Starting, Running | Stopping) => true,
            (Running, Authenticated | Stopping) => true,
            (Authenticated, Stopping) => true,
            // exits observed while up, and the end of a stop
            (Starting | Running | Authenticated | Stopping, Stopped) => true,
            (Creating | Created | Starting | Running | Authenticated | Stopping, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Status; 9] = [
        Status::Absent,
        Status::Creating,
        Status::Created,
        Status::Starting,
        Status::Running,
        Status::Authenticated,
        Status::Stopping,
        Status::Stopped,
        Status::Error,
    ];

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Status::Absent,
            Status::Creating,
            Status::Created,
            Status::Starting,
            Status::Running,
            Status::Authenticated,
            Status::Stopping,
            Status::Stopped,
            Status::Starting,
            Status::Running,
            Status::Stopping,
            Status::Stopped,
            Status::Absent,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_skips_are_rejected() {
        assert!(!Status::Created.can_transition_to(Status::Running));
        assert!(!Status::Absent.can_transition_to(Status::Running));
        assert!(!Status::Stopped.can_transition_to(Status::Running));
        assert!(!Status::Stopping.can_transition_to(Status::Running));
        assert!(!Status::Created.can_transition_to(Status::Stopped));
        assert!(!Status::Stopped.can_transition_to(Status::Stopped));
    }

    #[test]
    fn test_error_reachable_from_active_states() {
        for status in [
            Status::Creating,
            Status::Created,
            Status::Starting,
            Status::Running,
            Status::Authenticated,
            Status::Stopping,
        ] {
            assert!(status.can_transition_to(Status::Error), "{status}");
        }
        assert!(Status::Error.can_transition_to(Status::Starting));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&Status::Authenticated).unwrap(),
            "\"authenticated\""
        );
    }

    proptest! {
        #[test]
        fn every_record_state_can_be_deleted(i in 0usize..9) {
            let status = ALL[i];
            prop_assert_eq!(status.can_transition_to(Status::Absent), status != Status::Absent);
        }

        #[test]
        fn only_startable_states_reach_starting(i in 0usize..9) {
            let status = ALL[i];
            prop_assert_eq!(status.can_transition_to(Status::Starting), status.can_start());
        }
    }
}
