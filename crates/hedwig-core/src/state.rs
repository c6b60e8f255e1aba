use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Processing state of an attachment.
///
/// `Ready` and `Error` are terminal: only an administrative reset moves a
/// record out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    New,
    Processing,
    Ready,
    Error,
}

/// An event that moves an attachment between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A poll cycle takes ownership of a new record.
    Claim,
    /// Processing succeeded.
    Complete,
    /// Processing failed.
    Fail,
    /// Administrative reset of a failed or stuck record.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {transition} attachment in state {from}")]
pub struct TransitionError {
    pub from: AttachmentState,
    pub transition: Transition,
}

impl AttachmentState {
    pub const ALL: &[AttachmentState] = &[
        AttachmentState::New,
        AttachmentState::Processing,
        AttachmentState::Ready,
        AttachmentState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::New => "new",
            AttachmentState::Processing => "processing",
            AttachmentState::Ready => "ready",
            AttachmentState::Error => "error",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(AttachmentState::New),
            "processing" => Some(AttachmentState::Processing),
            "ready" => Some(AttachmentState::Ready),
            "error" => Some(AttachmentState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttachmentState::Ready | AttachmentState::Error)
    }

    /// Apply a transition, returning the resulting state.
    pub fn apply(self, transition: Transition) -> Result<AttachmentState, TransitionError> {
        use AttachmentState::*;
        match (self, transition) {
            (New, Transition::Claim) => Ok(Processing),
            (Processing, Transition::Complete) => Ok(Ready),
            (Processing, Transition::Fail) => Ok(Error),
            (Error | Processing, Transition::Reset) => Ok(New),
            (from, transition) => Err(TransitionError { from, transition }),
        }
    }

    /// Source states from which `transition` is legal.
    pub fn sources_for(transition: Transition) -> &'static [AttachmentState] {
        match transition {
            Transition::Claim => &[AttachmentState::New],
            Transition::Complete | Transition::Fail => &[AttachmentState::Processing],
            Transition::Reset => &[AttachmentState::Error, AttachmentState::Processing],
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Claim => "claim",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Reset => "reset",
        }
    }

    /// The state every legal application of this transition ends in.
    pub fn target(&self) -> AttachmentState {
        match self {
            Transition::Claim => AttachmentState::Processing,
            Transition::Complete => AttachmentState::Ready,
            Transition::Fail => AttachmentState::Error,
            Transition::Reset => AttachmentState::New,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSITIONS: [Transition; 4] = [
        Transition::Claim,
        Transition::Complete,
        Transition::Fail,
        Transition::Reset,
    ];

    #[test]
    fn parse_str_all() {
        assert_eq!(AttachmentState::parse_str("new"), Some(AttachmentState::New));
        assert_eq!(
            AttachmentState::parse_str("processing"),
            Some(AttachmentState::Processing)
        );
        assert_eq!(AttachmentState::parse_str("ready"), Some(AttachmentState::Ready));
        assert_eq!(AttachmentState::parse_str("error"), Some(AttachmentState::Error));
        assert_eq!(AttachmentState::parse_str("retry"), None);
        assert_eq!(AttachmentState::parse_str("NEW"), None);
        assert_eq!(AttachmentState::parse_str(""), None);
    }

    #[test]
    fn display_matches_as_str() {
        for s in AttachmentState::ALL {
            assert_eq!(format!("{s}"), s.as_str());
            assert_eq!(AttachmentState::parse_str(s.as_str()), Some(*s));
        }
    }

    #[test]
    fn happy_path() {
        let s = AttachmentState::New.apply(Transition::Claim).unwrap();
        assert_eq!(s, AttachmentState::Processing);
        assert_eq!(s.apply(Transition::Complete).unwrap(), AttachmentState::Ready);
        assert_eq!(s.apply(Transition::Fail).unwrap(), AttachmentState::Error);
    }

    #[test]
    fn reset_only_from_error_or_processing() {
        assert_eq!(
            AttachmentState::Error.apply(Transition::Reset).unwrap(),
            AttachmentState::New
        );
        assert_eq!(
            AttachmentState::Processing.apply(Transition::Reset).unwrap(),
            AttachmentState::New
        );
        assert!(AttachmentState::Ready.apply(Transition::Reset).is_err());
        assert!(AttachmentState::New.apply(Transition::Reset).is_err());
    }

    #[test]
    fn terminal_states_reject_everything_but_reset() {
        for from in [AttachmentState::Ready, AttachmentState::Error] {
            assert!(from.is_terminal());
            for t in [Transition::Claim, Transition::Complete, Transition::Fail] {
                let err = from.apply(t).unwrap_err();
                assert_eq!(err.from, from);
                assert_eq!(err.transition, t);
            }
        }
        assert!(!AttachmentState::New.is_terminal());
        assert!(!AttachmentState::Processing.is_terminal());
    }

    #[test]
    fn new_cannot_skip_processing() {
        assert!(AttachmentState::New.apply(Transition::Complete).is_err());
        assert!(AttachmentState::New.apply(Transition::Fail).is_err());
    }

    #[test]
    fn sources_agree_with_apply() {
        for t in TRANSITIONS {
            for s in AttachmentState::ALL {
                let legal = AttachmentState::sources_for(t).contains(s);
                assert_eq!(s.apply(t).is_ok(), legal, "{s} --{t}-->");
                if legal {
                    assert_eq!(s.apply(t).unwrap(), t.target());
                }
            }
        }
    }

    #[test]
    fn error_message() {
        let err = AttachmentState::Ready.apply(Transition::Claim).unwrap_err();
        assert_eq!(err.to_string(), "cannot claim attachment in state ready");
    }
}
