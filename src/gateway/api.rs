//! Wire request/response types for the assistant backend.

use crate::types::{Feedback, Message, MessageSource, Profile, ProfileGender, ProfileType};
use serde::{Deserialize, Serialize};

/// One `chat_history` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiChatHistoryEntry {
    pub role: String,
    pub content: String,
}

/// One `chat_history` entry with citation metadata (feedback submissions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiChatHistoryWithSources {
    pub role: String,
    pub content: String,
    pub sources: Vec<MessageSource>,
}

/// Profile shape the backend consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProfile {
    pub profile_type: String,
    pub user_age: i64,
    pub user_gender: String,
    pub user_condition: String,
}

/// The user's query within a turn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiQuery {
    pub role: String,
    pub content: String,
}

/// Voice-turn request body (transcript-seeded).
#[derive(Debug, Clone, Serialize)]
pub struct ApiVoiceRequest {
    pub chat_history: Vec<ApiChatHistoryEntry>,
    pub profile: ApiProfile,
    pub query: ApiQuery,
    pub language: String,
}

/// Chat-turn request body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiChatRequest {
    pub chat_history: Vec<ApiChatHistoryEntry>,
    pub profile: ApiProfile,
    pub query: ApiQuery,
    pub language: String,
}

/// Feedback submission body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiFeedbackRequest {
    pub date_time: String,
    pub feedback_type: String,
    pub feedback_category: String,
    pub feedback_remarks: String,
    pub user_profile: ApiProfile,
    pub chat_history: Vec<ApiChatHistoryWithSources>,
}

/// Text-to-speech request body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiSpeechRequest {
    pub text: String,
}

/// One decoded fragment of a streamed turn response.
///
/// Voice turns may carry any of these fields; chat turns carry only
/// `response_message` and `sources`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiStreamFragment {
    pub response_message: Option<String>,
    pub query_message: Option<String>,
    pub sources: Option<Vec<MessageSource>>,
    pub audio_base64: Option<String>,
}

/// Convert stored messages to the backend's `chat_history` shape.
pub fn to_chat_history(messages: &[Message]) -> Vec<ApiChatHistoryEntry> {
    messages
        .iter()
        .map(|m| ApiChatHistoryEntry {
            role: m.role.api_name().to_owned(),
            content: m.body.clone(),
        })
        .collect()
}

/// Convert stored messages to `chat_history` entries carrying sources.
pub fn to_chat_history_with_sources(messages: &[Message]) -> Vec<ApiChatHistoryWithSources> {
    messages
        .iter()
        .map(|m| ApiChatHistoryWithSources {
            role: m.role.api_name().to_owned(),
            content: m.body.clone(),
            sources: m.sources.clone(),
        })
        .collect()
}

/// Convert a profile to the backend's shape.
///
/// Ages are optional locally; the backend expects `-1` for "not provided".
pub fn to_api_profile(profile: &Profile) -> ApiProfile {
    let profile_type = match profile.profile_type {
        ProfileType::General => "general",
        ProfileType::Myself => "myself",
        ProfileType::Others => "others",
    };
    let gender = match profile.gender {
        ProfileGender::Male => "male",
        ProfileGender::Female => "female",
        ProfileGender::Unspecified => "unspecified",
    };
    ApiProfile {
        profile_type: profile_type.to_owned(),
        user_age: profile.age.map_or(-1, i64::from),
        user_gender: gender.to_owned(),
        user_condition: profile.existing_conditions.clone(),
    }
}

/// Build a feedback submission from the domain type.
pub fn to_feedback_request(feedback: &Feedback, profile: &Profile) -> ApiFeedbackRequest {
    ApiFeedbackRequest {
        date_time: feedback.datetime.clone(),
        feedback_type: feedback.label.clone(),
        feedback_category: feedback.category.clone(),
        feedback_remarks: feedback.remarks.clone(),
        user_profile: to_api_profile(profile),
        chat_history: to_chat_history_with_sources(&feedback.chat_history),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    #[test]
    fn chat_history_uses_wire_role_names() {
        let messages = vec![
            Message {
                id: "1".into(),
                profile_id: "p".into(),
                role: MessageRole::User,
                body: "hi".into(),
                timestamp: 1,
                sources: Vec::new(),
            },
            Message {
                id: "2".into(),
                profile_id: "p".into(),
                role: MessageRole::Assistant,
                body: "hello".into(),
                timestamp: 2,
                sources: Vec::new(),
            },
        ];
        let history = to_chat_history(&messages);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
    }

    #[test]
    fn missing_age_becomes_minus_one() {
        let api = to_api_profile(&Profile::general());
        assert_eq!(api.user_age, -1);
        assert_eq!(api.profile_type, "general");
    }

    #[test]
    fn fragment_tolerates_unknown_and_missing_fields() {
        let frag: ApiStreamFragment =
            serde_json::from_str(r#"{"response_message":"hi","extra":42}"#).expect("parse");
        assert_eq!(frag.response_message.as_deref(), Some("hi"));
        assert!(frag.sources.is_none());
        assert!(frag.audio_base64.is_none());
    }
}
