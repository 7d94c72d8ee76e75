//! Confirmation gate for side-effecting tools.
//!
//! Creating assets and sending email leave the system, so the supervisor
//! only issues those calls after an explicit affirmative user turn. The gate
//! lives in conversation state and is checked in code, not left to the
//! routing model.

use serde::{Deserialize, Serialize};

use serena_core::stream::FunctionCall;
use serena_core::tools::ToolKind;

const AFFIRMATIVE_WORDS: &[&str] = &[
    "yes", "yeah", "yep", "sure", "ok", "okay", "confirm", "confirmed", "proceed", "absolutely",
];
const AFFIRMATIVE_PHRASES: &[&str] = &["go ahead", "do it", "please do", "sounds good"];
const NEGATIVE_WORDS: &[&str] = &[
    "no", "nope", "don't", "dont", "not", "stop", "cancel", "wait",
];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CampaignGate {
    #[default]
    Idle,
    /// A side-effecting call was held back until the user answers.
    AwaitingConfirmation { pending: FunctionCall },
    /// The user agreed; the next side-effecting call runs, then the gate closes.
    Confirmed,
}

/// What the gate wants done with an incoming user turn.
#[derive(Clone, Debug, PartialEq)]
pub enum GateDecision {
    /// Route the turn normally.
    Route,
    /// The user confirmed; run the held call without routing.
    RunPending(FunctionCall),
    /// The user declined the held call.
    Declined,
}

impl CampaignGate {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingConfirmation { .. } => "awaiting_confirmation",
            Self::Confirmed => "confirmed",
        }
    }

    /// Resolve a held call against the user's answer. Anything that is
    /// neither a yes nor a no drops the held call.
    pub fn on_user_turn(&mut self, text: &str) -> GateDecision {
        let Self::AwaitingConfirmation { pending } = self else {
            return GateDecision::Route;
        };
        let pending = pending.clone();
        if is_affirmative(text) {
            *self = Self::Confirmed;
            GateDecision::RunPending(pending)
        } else if is_negative(text) {
            *self = Self::Idle;
            GateDecision::Declined
        } else {
            *self = Self::Idle;
            GateDecision::Route
        }
    }

    /// Whether `call` may run now. A refused call is held as pending.
    ///
    /// An affirmative turn that answers the assistant's own question counts
    /// as confirmation.
    pub fn authorize(
        &mut self,
        kind: ToolKind,
        call: &FunctionCall,
        user_text: &str,
        last_reply_was_question: bool,
    ) -> bool {
        if !kind.has_side_effects() {
            return true;
        }
        match self {
            Self::Confirmed => true,
            _ if last_reply_was_question && is_affirmative(user_text) => {
                *self = Self::Confirmed;
                true
            }
            _ => {
                *self = Self::AwaitingConfirmation {
                    pending: call.clone(),
                };
                false
            }
        }
    }

    /// A confirmation covers one side-effecting call. Once it has run, the
    /// gate closes and the next asset or email needs a fresh answer.
    pub fn complete(&mut self, kind: ToolKind) {
        if kind.has_side_effects() {
            *self = Self::Idle;
        }
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_negative(text: &str) -> bool {
    words(text).iter().any(|w| NEGATIVE_WORDS.contains(&w.as_str()))
}

pub fn is_affirmative(text: &str) -> bool {
    if is_negative(text) {
        return false;
    }
    let words = words(text);
    if words.iter().any(|w| AFFIRMATIVE_WORDS.contains(&w.as_str())) {
        return true;
    }
    let joined = words.join(" ");
    AFFIRMATIVE_PHRASES.iter().any(|p| {
        joined == *p || joined.starts_with(&format!("{p} ")) || joined.contains(&format!(" {p}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn poster_call() -> FunctionCall {
        FunctionCall {
            name: "call_poster_agent".into(),
            args: json!({"user_prompt": "summer sale"}),
        }
    }

    #[test]
    fn classifies_answers() {
        assert!(is_affirmative("Yes, go ahead!"));
        assert!(is_affirmative("ok"));
        assert!(is_affirmative("Sounds good to me"));
        assert!(is_affirmative("please do"));
        assert!(!is_affirmative("no, don't send it"));
        assert!(!is_affirmative("Show me sales by country"));
        assert!(is_negative("Wait."));
        assert!(is_negative("Don't"));
        assert!(!is_negative("yes"));
    }

    #[test]
    fn side_effect_without_confirmation_is_held() {
        let mut gate = CampaignGate::Idle;
        assert!(!gate.authorize(ToolKind::Asset, &poster_call(), "make a poster", false));
        assert_eq!(gate.name(), "awaiting_confirmation");
        assert!(gate.authorize(ToolKind::Query, &poster_call(), "anything", false));
    }

    #[test]
    fn yes_releases_pending_call() {
        let mut gate = CampaignGate::AwaitingConfirmation {
            pending: poster_call(),
        };
        assert_eq!(gate.on_user_turn("yes please"), GateDecision::RunPending(poster_call()));
        assert_eq!(gate, CampaignGate::Confirmed);
        assert!(gate.authorize(ToolKind::Email, &poster_call(), "send it", false));
    }

    #[test]
    fn no_declines_and_other_text_drops() {
        let mut gate = CampaignGate::AwaitingConfirmation {
            pending: poster_call(),
        };
        assert_eq!(gate.on_user_turn("no thanks"), GateDecision::Declined);
        assert_eq!(gate, CampaignGate::Idle);

        let mut gate = CampaignGate::AwaitingConfirmation {
            pending: poster_call(),
        };
        assert_eq!(gate.on_user_turn("what were the top products?"), GateDecision::Route);
        assert_eq!(gate, CampaignGate::Idle);
    }

    #[test]
    fn affirmative_answer_to_question_confirms() {
        let mut gate = CampaignGate::Idle;
        assert!(gate.authorize(ToolKind::Asset, &poster_call(), "yes, create it", true));
        assert_eq!(gate, CampaignGate::Confirmed);
    }

    #[test]
    fn confirmation_covers_one_side_effect() {
        let mut gate = CampaignGate::Confirmed;
        gate.complete(ToolKind::Query);
        assert_eq!(gate, CampaignGate::Confirmed);
        gate.complete(ToolKind::Asset);
        assert_eq!(gate, CampaignGate::Idle);
        assert!(!gate.authorize(ToolKind::Asset, &poster_call(), "another poster", false));
        assert_eq!(gate.name(), "awaiting_confirmation");

        let mut gate = CampaignGate::Confirmed;
        gate.complete(ToolKind::Email);
        assert_eq!(gate, CampaignGate::Idle);
    }

    #[test]
    fn gate_roundtrips_through_state_json() {
        let gate = CampaignGate::AwaitingConfirmation {
            pending: poster_call(),
        };
        let value = serde_json::to_value(&gate).unwrap();
        assert_eq!(value["state"], "awaiting_confirmation");
        let back: CampaignGate = serde_json::from_value(value).unwrap();
        assert_eq!(back, gate);
    }
}
