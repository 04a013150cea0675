//! Image processing status and its forward-only transition rule.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle status of an image record.
///
/// The staging pipeline only ever moves forward:
///
/// ```text
/// queued ──► processing ──► ready
///    │            │
///    └────────────┴───────► error
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Queued,
    Processing,
    Ready,
    Error,
}

impl ImageStatus {
    pub const ALL: [ImageStatus; 4] = [
        ImageStatus::Queued,
        ImageStatus::Processing,
        ImageStatus::Ready,
        ImageStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Processing => "processing",
            ImageStatus::Ready => "ready",
            ImageStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Ready | ImageStatus::Error)
    }

    /// Whether `self -> next` is allowed.
    ///
    /// `processing -> processing` is allowed so that marking an image as
    /// processing is idempotent under redelivery.
    pub fn can_transition_to(&self, next: ImageStatus) -> bool {
        match (self, next) {
            (ImageStatus::Queued, ImageStatus::Processing)
            | (ImageStatus::Processing, ImageStatus::Processing) => true,
            (ImageStatus::Queued | ImageStatus::Processing, ImageStatus::Ready | ImageStatus::Error) => {
                true
            }
            _ => false,
        }
    }

    /// Like [`can_transition_to`](Self::can_transition_to) but returns a typed error.
    pub fn check_transition(&self, next: ImageStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(*self, next))
        }
    }
}

impl core::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ImageStatus::Queued),
            "processing" => Ok(ImageStatus::Processing),
            "ready" => Ok(ImageStatus::Ready),
            "error" => Ok(ImageStatus::Error),
            other => Err(DomainError::validation(format!("unknown image status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = ImageStatus> {
        prop::sample::select(ImageStatus::ALL.to_vec())
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [ImageStatus::Ready, ImageStatus::Error] {
            for to in ImageStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn nothing_returns_to_queued() {
        for from in ImageStatus::ALL {
            assert!(!from.can_transition_to(ImageStatus::Queued));
        }
    }

    #[test]
    fn parses_its_own_display_form() {
        for s in ImageStatus::ALL {
            assert_eq!(s.to_string().parse::<ImageStatus>().unwrap(), s);
        }
        assert!("done".parse::<ImageStatus>().is_err());
    }

    proptest! {
        /// Replaying any sequence of requested transitions (skipping rejected
        /// ones) never leaves a terminal state once it has been reached.
        #[test]
        fn accepted_transitions_never_regress(requests in prop::collection::vec(any_status(), 0..32)) {
            let mut current = ImageStatus::Queued;
            let mut reached_terminal: Option<ImageStatus> = None;

            for next in requests {
                if current.check_transition(next).is_ok() {
                    current = next;
                }
                if let Some(t) = reached_terminal {
                    prop_assert_eq!(current, t);
                }
                if current.is_terminal() {
                    reached_terminal = Some(current);
                }
            }
        }
    }
}
