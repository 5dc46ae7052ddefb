//! The content model: a tagged-variant payload carried by every commit.
//!
//! Built-in variants are matched against a fixed set of content-type tags.
//! A per-tract [`registry::ContentTypeRegistry`] extends the set with custom
//! tags whose bodies are validated by a host-supplied closure. Every payload
//! round-trips through a canonical `serde_json::Value` form (sorted keys, no
//! insignificant whitespace) so that [`crate::hash::canonical_hash`] can hash
//! it deterministically regardless of field insertion order.

pub mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::TraceError;
use crate::hash::{TraceHash, canonical_bytes, canonical_hash};

pub use registry::ContentTypeRegistry;

/// The role a compiled message is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Whether a [`ContentPayload::Session`] marker opens or closes a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMarkerKind {
    Start,
    End,
}

/// A tagged-variant content payload. See the module docs for the
/// canonicalization contract.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPayload {
    Instruction {
        text: String,
    },
    Dialogue {
        text: String,
        role: Role,
    },
    ToolIo {
        tool_name: String,
        call: Value,
        result: Value,
    },
    Reasoning {
        text: String,
    },
    Artifact {
        title: String,
        body: String,
        mime_type: String,
    },
    Output {
        text: String,
    },
    Freeform {
        fields: BTreeMap<String, Value>,
    },
    Session {
        session_type: SessionMarkerKind,
        summary: String,
        decisions: Vec<String>,
        next_steps: Vec<String>,
    },
    /// A payload whose tag is not one of the built-ins above. `tag` must be
    /// registered in the tract's [`ContentTypeRegistry`] or validation fails.
    Custom {
        tag: String,
        body: Value,
    },
}

/// The built-in content-type tags.
pub const BUILTIN_TAGS: &[&str] = &[
    "instruction",
    "dialogue",
    "tool_io",
    "reasoning",
    "artifact",
    "output",
    "freeform",
    "session",
];

impl ContentPayload {
    /// The stable string tag stored on the owning commit's `content_type`.
    pub fn content_type(&self) -> &str {
        match self {
            ContentPayload::Instruction { .. } => "instruction",
            ContentPayload::Dialogue { .. } => "dialogue",
            ContentPayload::ToolIo { .. } => "tool_io",
            ContentPayload::Reasoning { .. } => "reasoning",
            ContentPayload::Artifact { .. } => "artifact",
            ContentPayload::Output { .. } => "output",
            ContentPayload::Freeform { .. } => "freeform",
            ContentPayload::Session { .. } => "session",
            ContentPayload::Custom { tag, .. } => tag,
        }
    }

    /// The role a compiled message built from this payload is attributed to,
    /// absent any per-commit override.
    pub fn default_role(&self) -> Role {
        match self {
            ContentPayload::Dialogue { role, .. } => *role,
            _ => Role::System,
        }
    }

    /// Serialize to the canonical object form: a flat JSON object carrying
    /// `content_type` plus the variant's own fields, recursively key-sorted.
    pub fn to_canonical_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("content_type".to_string(), json!(self.content_type()));
        match self {
            ContentPayload::Instruction { text } | ContentPayload::Reasoning { text } => {
                obj.insert("text".to_string(), json!(text));
            }
            ContentPayload::Dialogue { text, role } => {
                obj.insert("text".to_string(), json!(text));
                obj.insert("role".to_string(), json!(role.as_str()));
            }
            ContentPayload::ToolIo {
                tool_name,
                call,
                result,
            } => {
                obj.insert("tool_name".to_string(), json!(tool_name));
                obj.insert("call".to_string(), call.clone());
                obj.insert("result".to_string(), result.clone());
            }
            ContentPayload::Artifact {
                title,
                body,
                mime_type,
            } => {
                obj.insert("title".to_string(), json!(title));
                obj.insert("body".to_string(), json!(body));
                obj.insert("mime_type".to_string(), json!(mime_type));
            }
            ContentPayload::Output { text } => {
                obj.insert("text".to_string(), json!(text));
            }
            ContentPayload::Freeform { fields } => {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
            }
            ContentPayload::Session {
                session_type,
                summary,
                decisions,
                next_steps,
            } => {
                obj.insert(
                    "session_type".to_string(),
                    json!(match session_type {
                        SessionMarkerKind::Start => "start",
                        SessionMarkerKind::End => "end",
                    }),
                );
                obj.insert("summary".to_string(), json!(summary));
                obj.insert("decisions".to_string(), json!(decisions));
                obj.insert("next_steps".to_string(), json!(next_steps));
            }
            ContentPayload::Custom { body, .. } => {
                if let Value::Object(map) = body {
                    for (k, v) in map {
                        obj.insert(k.clone(), v.clone());
                    }
                } else {
                    obj.insert("value".to_string(), body.clone());
                }
            }
        }
        let mut value = Value::Object(obj);
        crate::hash::canonicalize_json(&mut value);
        value
    }

    /// Parse from the canonical object form produced by [`Self::to_canonical_value`].
    pub fn from_canonical_value(
        value: &Value,
        registry: &ContentTypeRegistry,
    ) -> Result<Self, TraceError> {
        let obj = value
            .as_object()
            .ok_or_else(|| TraceError::validation("unknown", "payload is not a JSON object"))?;
        let tag = obj
            .get("content_type")
            .and_then(Value::as_str)
            .ok_or_else(|| TraceError::validation("unknown", "missing content_type"))?
            .to_string();

        let text_field = |name: &str| -> Result<String, TraceError> {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| TraceError::validation(&tag, format!("missing field `{name}`")))
        };

        let payload = match tag.as_str() {
            "instruction" => ContentPayload::Instruction {
                text: text_field("text")?,
            },
            "dialogue" => {
                let role_str = text_field("role")?;
                let role = match role_str.as_str() {
                    "system" => Role::System,
                    "user" => Role::User,
                    "assistant" => Role::Assistant,
                    other => {
                        return Err(TraceError::validation(
                            &tag,
                            format!("invalid role `{other}`"),
                        ));
                    }
                };
                ContentPayload::Dialogue {
                    text: text_field("text")?,
                    role,
                }
            }
            "tool_io" => ContentPayload::ToolIo {
                tool_name: text_field("tool_name")?,
                call: obj.get("call").cloned().unwrap_or(Value::Null),
                result: obj.get("result").cloned().unwrap_or(Value::Null),
            },
            "reasoning" => ContentPayload::Reasoning {
                text: text_field("text")?,
            },
            "artifact" => ContentPayload::Artifact {
                title: text_field("title")?,
                body: text_field("body")?,
                mime_type: text_field("mime_type")?,
            },
            "output" => ContentPayload::Output {
                text: text_field("text")?,
            },
            "freeform" => {
                let mut fields = BTreeMap::new();
                for (k, v) in obj {
                    if k != "content_type" {
                        fields.insert(k.clone(), v.clone());
                    }
                }
                ContentPayload::Freeform { fields }
            }
            "session" => {
                let session_type = match text_field("session_type")?.as_str() {
                    "start" => SessionMarkerKind::Start,
                    "end" => SessionMarkerKind::End,
                    other => {
                        return Err(TraceError::validation(
                            &tag,
                            format!("invalid session_type `{other}`"),
                        ));
                    }
                };
                ContentPayload::Session {
                    session_type,
                    summary: text_field("summary")?,
                    decisions: obj
                        .get("decisions")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                    next_steps: obj
                        .get("next_steps")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                }
            }
            custom_tag => {
                if !registry.is_registered(custom_tag) {
                    return Err(TraceError::UnknownContentType(custom_tag.to_string()));
                }
                let mut body = Map::new();
                for (k, v) in obj {
                    if k != "content_type" {
                        body.insert(k.clone(), v.clone());
                    }
                }
                let body = Value::Object(body);
                registry
                    .validate(custom_tag, &body)
                    .map_err(|reason| TraceError::validation(custom_tag, reason))?;
                ContentPayload::Custom {
                    tag: custom_tag.to_string(),
                    body,
                }
            }
        };
        Ok(payload)
    }

    /// Validate this payload's structural shape (and, for custom tags, run
    /// the registered validator). Built-in variants are already structurally
    /// valid by construction; this re-validates round-tripped/deserialized
    /// instances, e.g. freshly loaded from storage.
    pub fn validate(&self, registry: &ContentTypeRegistry) -> Result<(), TraceError> {
        if let ContentPayload::Custom { tag, body } = self {
            if !registry.is_registered(tag) {
                return Err(TraceError::UnknownContentType(tag.clone()));
            }
            registry
                .validate(tag, body)
                .map_err(|reason| TraceError::validation(tag, reason))?;
        }
        Ok(())
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        // `to_canonical_value` is already key-sorted; serde_json serializes
        // a `Value` deterministically given sorted keys, so this never fails.
        canonical_bytes(&self.to_canonical_value()).expect("Value serialization is infallible")
    }

    pub fn content_hash(&self) -> TraceHash {
        TraceHash::of_bytes(&self.canonical_bytes())
    }

    /// Full text rendering used both for token counting and as the compiled
    /// message body — unlike [`Self::preview`], never truncated.
    pub fn as_message_text(&self) -> String {
        match self {
            ContentPayload::Instruction { text }
            | ContentPayload::Dialogue { text, .. }
            | ContentPayload::Reasoning { text }
            | ContentPayload::Output { text } => text.clone(),
            ContentPayload::ToolIo {
                tool_name,
                call,
                result,
            } => format!("[{tool_name}] call={call} result={result}"),
            ContentPayload::Artifact {
                title,
                body,
                mime_type,
            } => format!("{title} ({mime_type})\n{body}"),
            ContentPayload::Freeform { fields } => {
                serde_json::to_string(fields).unwrap_or_default()
            }
            ContentPayload::Session {
                summary,
                decisions,
                next_steps,
                ..
            } => {
                let mut out = summary.clone();
                if !decisions.is_empty() {
                    out.push_str("\ndecisions: ");
                    out.push_str(&decisions.join("; "));
                }
                if !next_steps.is_empty() {
                    out.push_str("\nnext steps: ");
                    out.push_str(&next_steps.join("; "));
                }
                out
            }
            ContentPayload::Custom { body, .. } => body.to_string(),
        }
    }

    /// A short human-readable summary used to synthesize commit messages.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = match self {
            ContentPayload::Instruction { text }
            | ContentPayload::Dialogue { text, .. }
            | ContentPayload::Reasoning { text }
            | ContentPayload::Output { text } => text.clone(),
            ContentPayload::ToolIo { tool_name, .. } => format!("tool call: {tool_name}"),
            ContentPayload::Artifact { title, .. } => title.clone(),
            ContentPayload::Freeform { fields } => {
                fields.keys().cloned().collect::<Vec<_>>().join(", ")
            }
            ContentPayload::Session { summary, .. } => summary.clone(),
            ContentPayload::Custom { tag, .. } => format!("custom:{tag}"),
        };
        truncate_chars(&text, max_chars)
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('\u{2026}');
    out
}

/// Convenience alias used throughout the engine for the raw stored form of
/// `content_hash` and `canonical_hash`, kept for call-sites that only need the
/// digest and not the `ContentPayload` bound.
pub fn content_hash_of_value(value: &Value) -> Result<TraceHash, TraceError> {
    canonical_hash(value).map_err(TraceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialogue_round_trips_through_canonical_value() {
        let registry = ContentTypeRegistry::new();
        let payload = ContentPayload::Dialogue {
            text: "hi".to_string(),
            role: Role::User,
        };
        let value = payload.to_canonical_value();
        let back = ContentPayload::from_canonical_value(&value, &registry).expect("parse");
        assert_eq!(payload, back);
    }

    #[test]
    fn content_hash_stable_under_field_order() {
        let a = ContentPayload::ToolIo {
            tool_name: "grep".to_string(),
            call: json!({"pattern": "foo", "path": "."}),
            result: json!({"matches": 3}),
        };
        let hash_a = a.content_hash();
        let hash_b = a.clone().content_hash();
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn unregistered_custom_tag_is_rejected() {
        let registry = ContentTypeRegistry::new();
        let value = json!({"content_type": "widget", "color": "red"});
        let err = ContentPayload::from_canonical_value(&value, &registry).unwrap_err();
        assert!(matches!(err, TraceError::UnknownContentType(tag) if tag == "widget"));
    }

    #[test]
    fn registered_custom_tag_round_trips() {
        let mut registry = ContentTypeRegistry::new();
        registry.register("widget", |body| {
            if body.get("color").is_some() {
                Ok(())
            } else {
                Err("missing color".to_string())
            }
        });
        let value = json!({"content_type": "widget", "color": "red"});
        let payload = ContentPayload::from_canonical_value(&value, &registry).expect("parse");
        assert_eq!(payload.content_type(), "widget");
        payload.validate(&registry).expect("valid");
    }

    #[test]
    fn freeform_excludes_content_type_key_from_fields() {
        let value = json!({"content_type": "freeform", "a": 1, "b": 2});
        let registry = ContentTypeRegistry::new();
        let payload = ContentPayload::from_canonical_value(&value, &registry).expect("parse");
        match payload {
            ContentPayload::Freeform { fields } => assert_eq!(fields.len(), 2),
            _ => panic!("expected freeform"),
        }
    }
}
