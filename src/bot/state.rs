//! Control states and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Idle,
    Init,
    Restart,
    Trading,
    Exit,
    Error,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Idle => "idle",
            BotState::Init => "init",
            BotState::Restart => "restart",
            BotState::Trading => "trading",
            BotState::Exit => "exit",
            BotState::Error => "error",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Init,
    Restart,
    Start,
    Stop,
    Idle,
    /// Forced, valid from any state
    Redbutton,
    /// Forced, valid from any state
    Reset,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Init => "init",
            Transition::Restart => "restart",
            Transition::Start => "start",
            Transition::Stop => "stop",
            Transition::Idle => "idle",
            Transition::Redbutton => "redbutton",
            Transition::Reset => "reset",
        }
    }

    /// Target of `self` from `from`, or `None` when the table has no such edge
    pub fn target(&self, from: BotState) -> Option<BotState> {
        match (self, from) {
            (Transition::Init, BotState::Idle) => Some(BotState::Init),
            (Transition::Restart, BotState::Idle) => Some(BotState::Restart),
            (Transition::Start, BotState::Init | BotState::Restart) => Some(BotState::Trading),
            (Transition::Stop, BotState::Trading) => Some(BotState::Exit),
            (Transition::Idle, BotState::Exit) => Some(BotState::Idle),
            (Transition::Redbutton, _) => Some(BotState::Error),
            (Transition::Reset, _) => Some(BotState::Idle),
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
