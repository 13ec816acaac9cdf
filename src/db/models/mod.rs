mod authorization_flow;
mod device_flow;
mod job;
mod pilot;
mod refresh_token;
pub mod sandbox;

pub use self::authorization_flow::{AuthorizationFlow, CodeRedeem};
pub use self::device_flow::{DeviceFlow, DeviceFlowPoll};
pub use self::job::Job;
pub use self::pilot::Pilot;
pub use self::refresh_token::{RefreshToken, RefreshUse, RefreshTokenStatus};
pub use self::sandbox::Sandbox;

use std::fmt;

/// The life of the two interactive flows.
///
/// PENDING is set on insertion, READY or ERROR in response to the IdP leg, and
/// DONE once the token pair has been minted. DONE flows are dead: they are
/// kept until purge only to answer replays deterministically.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowStatus {
    Pending,
    Ready,
    Done,
    Error,
}

impl FlowStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "READY" => Some(Self::Ready),
            "DONE" => Some(Self::Done),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
