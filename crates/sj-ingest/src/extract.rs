// SPDX-License-Identifier: MIT OR Apache-2.0
//! Projection from events to utterances.
//!
//! Each supported event type yields a fixed list of text-bearing fields.
//! Texts are normalized inline and language-detected once, here; nothing
//! downstream recomputes either.

use serde::Deserialize;
use sj_core::{utterance_uuid, EventEnvelope, SourceKind, Utterance};
use sj_normalize::{detect_script_lang, normalize};

// -- payload projections -----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
    #[serde(default)]
    commits: Vec<PushCommit>,
}

#[derive(Debug, Default, Deserialize)]
struct PushCommit {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct IssuesPayload {
    #[serde(default)]
    issue: TitledBody,
}

#[derive(Debug, Default, Deserialize)]
struct IssueCommentPayload {
    #[serde(default)]
    issue: TitledBody,
    #[serde(default)]
    comment: BodyOnly,
}

#[derive(Debug, Default, Deserialize)]
struct PullRequestPayload {
    #[serde(default)]
    pull_request: TitledBody,
}

#[derive(Debug, Default, Deserialize)]
struct CommentPayload {
    #[serde(default)]
    comment: BodyOnly,
}

#[derive(Debug, Default, Deserialize)]
struct TitledBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BodyOnly {
    #[serde(default)]
    body: Option<String>,
}

// -- extraction --------------------------------------------------------------

/// One candidate text with its source tags, before emptiness filtering.
struct Candidate {
    source: SourceKind,
    source_detail: &'static str,
    text: String,
}

fn candidates(envelope: &EventEnvelope) -> Vec<Candidate> {
    let payload = &envelope.payload;
    let mut out = Vec::new();

    match envelope.event_type.as_str() {
        "PushEvent" => {
            let push: PushPayload = project(payload);
            for commit in push.commits {
                out.push(Candidate {
                    source: SourceKind::Commit,
                    source_detail: "push:commit",
                    text: commit.message,
                });
            }
        }
        "IssuesEvent" => {
            let issues: IssuesPayload = project(payload);
            push_opt(&mut out, SourceKind::Issue, "issues:title", issues.issue.title);
            push_opt(&mut out, SourceKind::Issue, "issues:body", issues.issue.body);
        }
        "IssueCommentEvent" => {
            let ic: IssueCommentPayload = project(payload);
            push_opt(&mut out, SourceKind::Comment, "issue_comment:title", ic.issue.title);
            push_opt(&mut out, SourceKind::Comment, "issue_comment:body", ic.comment.body);
        }
        "PullRequestEvent" => {
            let pr: PullRequestPayload = project(payload);
            push_opt(&mut out, SourceKind::Pr, "pr:title", pr.pull_request.title);
            push_opt(&mut out, SourceKind::Pr, "pr:body", pr.pull_request.body);
        }
        "PullRequestReviewCommentEvent" => {
            let rc: CommentPayload = project(payload);
            push_opt(&mut out, SourceKind::Comment, "pr_review_comment:body", rc.comment.body);
        }
        "CommitCommentEvent" => {
            let cc: CommentPayload = project(payload);
            push_opt(&mut out, SourceKind::Comment, "commit_comment:body", cc.comment.body);
        }
        // Unknown event types carry no utterances.
        _ => {}
    }

    out
}

fn project<T: Default + for<'de> Deserialize<'de>>(payload: &serde_json::Value) -> T {
    serde_json::from_value(payload.clone()).unwrap_or_default()
}

fn push_opt(out: &mut Vec<Candidate>, source: SourceKind, detail: &'static str, text: Option<String>) {
    if let Some(text) = text {
        out.push(Candidate {
            source,
            source_detail: detail,
            text,
        });
    }
}

/// Project an event into its utterances.
///
/// Empty or whitespace-only texts are skipped; ordinals number the emitted
/// utterances per event, starting at 0, in field order.
pub fn extract_utterances(envelope: &EventEnvelope) -> Vec<Utterance> {
    let mut utterances = Vec::new();
    let mut ordinal = 0i32;

    for candidate in candidates(envelope) {
        if candidate.text.trim().is_empty() {
            continue;
        }
        let text_normalized = normalize(&candidate.text);
        if text_normalized.is_empty() {
            continue;
        }
        let script_lang = detect_script_lang(&text_normalized);

        utterances.push(Utterance {
            utterance_id: utterance_uuid(&envelope.id, candidate.source, ordinal),
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            repo_id: envelope.repo.id,
            actor_id: envelope.actor.id,
            repo_name: envelope.repo.name.clone(),
            actor_login: envelope.actor.login.clone(),
            created_at: envelope.created_at,
            source: candidate.source,
            source_detail: candidate.source_detail.to_string(),
            ordinal,
            text_raw: candidate.text,
            text_normalized,
            lang_code: script_lang.lang_code,
            script: script_lang.script,
        });
        ordinal += 1;
    }

    utterances
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        serde_json::from_value(json!({
            "id": "42",
            "type": event_type,
            "actor": {"id": 7, "login": "octocat"},
            "repo": {"id": 9, "name": "octocat/hello"},
            "payload": payload,
            "created_at": "2025-08-01T00:30:00Z"
        }))
        .unwrap()
    }

    // -- Projection table --------------------------------------------------

    #[test]
    fn push_event_emits_one_per_commit() {
        let ev = envelope(
            "PushEvent",
            json!({"commits": [{"message": "fix the build"}, {"message": "revert that"}]}),
        );
        let utts = extract_utterances(&ev);
        assert_eq!(utts.len(), 2);
        assert!(utts.iter().all(|u| u.source == SourceKind::Commit));
        assert!(utts.iter().all(|u| u.source_detail == "push:commit"));
        assert_eq!(utts[0].ordinal, 0);
        assert_eq!(utts[1].ordinal, 1);
    }

    #[test]
    fn issues_event_emits_title_and_body() {
        let ev = envelope(
            "IssuesEvent",
            json!({"issue": {"title": "it broke", "body": "details here"}}),
        );
        let utts = extract_utterances(&ev);
        assert_eq!(utts.len(), 2);
        assert_eq!(utts[0].source_detail, "issues:title");
        assert_eq!(utts[1].source_detail, "issues:body");
        assert!(utts.iter().all(|u| u.source == SourceKind::Issue));
    }

    #[test]
    fn issue_comment_event_tags_as_comment() {
        let ev = envelope(
            "IssueCommentEvent",
            json!({"issue": {"title": "t"}, "comment": {"body": "c"}}),
        );
        let utts = extract_utterances(&ev);
        assert_eq!(utts.len(), 2);
        assert_eq!(utts[0].source_detail, "issue_comment:title");
        assert_eq!(utts[1].source_detail, "issue_comment:body");
        assert!(utts.iter().all(|u| u.source == SourceKind::Comment));
    }

    #[test]
    fn pull_request_event() {
        let ev = envelope(
            "PullRequestEvent",
            json!({"pull_request": {"title": "add feature", "body": "please review"}}),
        );
        let utts = extract_utterances(&ev);
        assert_eq!(utts.len(), 2);
        assert_eq!(utts[0].source, SourceKind::Pr);
        assert_eq!(utts[0].source_detail, "pr:title");
        assert_eq!(utts[1].source_detail, "pr:body");
    }

    #[test]
    fn review_and_commit_comments() {
        let rc = envelope(
            "PullRequestReviewCommentEvent",
            json!({"comment": {"body": "nit: rename"}}),
        );
        assert_eq!(extract_utterances(&rc)[0].source_detail, "pr_review_comment:body");

        let cc = envelope("CommitCommentEvent", json!({"comment": {"body": "why?"}}));
        assert_eq!(extract_utterances(&cc)[0].source_detail, "commit_comment:body");
    }

    #[test]
    fn unknown_event_type_yields_nothing() {
        let ev = envelope("WatchEvent", json!({"action": "started"}));
        assert!(extract_utterances(&ev).is_empty());
    }

    // -- Filtering & ordinals ----------------------------------------------

    #[test]
    fn empty_and_whitespace_texts_are_skipped() {
        let ev = envelope(
            "IssuesEvent",
            json!({"issue": {"title": "   ", "body": "real body"}}),
        );
        let utts = extract_utterances(&ev);
        assert_eq!(utts.len(), 1);
        assert_eq!(utts[0].source_detail, "issues:body");
        assert_eq!(utts[0].ordinal, 0, "ordinals number emitted utterances");
    }

    #[test]
    fn missing_body_is_not_emitted() {
        let ev = envelope("IssuesEvent", json!({"issue": {"title": "only title"}}));
        let utts = extract_utterances(&ev);
        assert_eq!(utts.len(), 1);
        assert_eq!(utts[0].source_detail, "issues:title");
    }

    #[test]
    fn malformed_payload_shape_yields_nothing() {
        let ev = envelope("PushEvent", json!({"commits": "not-a-list"}));
        assert!(extract_utterances(&ev).is_empty());
    }

    // -- Normalization & identity ------------------------------------------

    #[test]
    fn text_is_normalized_inline() {
        let ev = envelope("PushEvent", json!({"commits": [{"message": "FIX  the   5h1t"}]}));
        let utts = extract_utterances(&ev);
        assert_eq!(utts[0].text_raw, "FIX  the   5h1t");
        assert_eq!(utts[0].text_normalized, "fix the shit");
    }

    #[test]
    fn utterance_id_is_deterministic() {
        let ev = envelope("PushEvent", json!({"commits": [{"message": "same"}]}));
        let a = extract_utterances(&ev);
        let b = extract_utterances(&ev);
        assert_eq!(a[0].utterance_id, b[0].utterance_id);
    }

    #[test]
    fn language_is_detected_on_normalized_text() {
        let ev = envelope(
            "IssuesEvent",
            json!({"issue": {"body": "이것은 충분히 긴 한국어 문장입니다 정말로 충분히 깁니다"}}),
        );
        let utts = extract_utterances(&ev);
        assert_eq!(utts[0].lang_code.as_deref(), Some("ko"));
        assert_eq!(utts[0].script.as_deref(), Some("Hangul"));
    }

    #[test]
    fn principals_are_carried() {
        let ev = envelope("CommitCommentEvent", json!({"comment": {"body": "hm"}}));
        let utts = extract_utterances(&ev);
        assert_eq!(utts[0].repo_id, 9);
        assert_eq!(utts[0].actor_id, 7);
        assert_eq!(utts[0].repo_name, "octocat/hello");
        assert_eq!(utts[0].actor_login, "octocat");
    }
}
