//! Webhook payloads from Bitbucket and GitHub translated into [`Trigger`]s.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::credential::SubCredType;
use crate::models::trigger::{Commit, PrUrls, Trigger};

pub const BITBUCKET_EVENT_HEADER: &str = "x-event-key";
pub const GITHUB_EVENT_HEADER: &str = "x-github-event";

/// Decode `body` and translate it according to the event header value.
pub fn translate(vcs: SubCredType, event: &str, body: &[u8]) -> Result<Trigger> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("unable to decode {vcs} webhook body: {e}")))?;
    match vcs {
        SubCredType::Bitbucket => bitbucket_event(event, &payload),
        SubCredType::Github => github_event(event, &payload),
        other => Err(Error::UnsupportedEvent(format!("{other} webhooks"))),
    }
}

pub fn bitbucket_event(event: &str, payload: &Value) -> Result<Trigger> {
    match event {
        "repo:push" => bitbucket_push(payload),
        "pullrequest:created" | "pullrequest:updated" => bitbucket_pull_request(payload),
        other => Err(Error::UnsupportedEvent(other.to_string())),
    }
}

pub fn github_event(event: &str, payload: &Value) -> Result<Trigger> {
    match event {
        "push" => github_push(payload),
        "pull_request" => github_pull_request(payload),
        "ping" => Err(Error::NoBuildEvent("ping".to_string())),
        other => Err(Error::UnsupportedEvent(other.to_string())),
    }
}

fn required<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(Error::NoBuildEvent(format!("payload is missing {what}"))),
    }
}

fn optional(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty() && !is_null_sha(s))
        .map(str::to_string)
}

fn is_null_sha(hash: &str) -> bool {
    hash.chars().all(|c| c == '0')
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn href(links: &Value, name: &str) -> String {
    links[name]["href"].as_str().unwrap_or_default().to_string()
}

fn bitbucket_push(payload: &Value) -> Result<Trigger> {
    let changes = match payload["push"]["changes"].as_array() {
        Some(changes) if !changes.is_empty() => changes,
        _ => return Err(Error::NoBuildEvent("no commits found in push".to_string())),
    };
    if changes.len() > 1 {
        return Err(Error::Validation("too many changesets".to_string()));
    }
    let change = &changes[0];

    let new = &change["new"];
    if new.is_null() {
        return Err(Error::NoBuildEvent(
            "push has no new head, branch was deleted".to_string(),
        ));
    }
    let kind = new["type"].as_str().unwrap_or_default();
    if kind != "branch" {
        return Err(Error::NoBuildEvent(format!(
            "push of a {kind} is not a branch push"
        )));
    }

    let repo = required(&payload["repository"]["full_name"], "repository.full_name")?;
    let branch = required(&new["name"], "new.name")?;
    let head = required(&new["target"]["hash"], "new.target.hash")?;

    let commits: Vec<Commit> = change["commits"]
        .as_array()
        .map(|list| {
            list.iter()
                .map(|c| Commit {
                    hash: c["hash"].as_str().unwrap_or_default().to_string(),
                    message: c["message"].as_str().unwrap_or_default().to_string(),
                    author: c["author"]["raw"].as_str().unwrap_or_default().to_string(),
                    date: timestamp(&c["date"]),
                })
                .collect()
        })
        .unwrap_or_default();

    let previous = optional(&change["old"]["target"]["hash"])
        .or_else(|| commits.last().map(|c| c.hash.clone()).filter(|h| !h.is_empty()));

    Ok(Trigger::Push {
        repo: repo.to_string(),
        vcs_type: Some(SubCredType::Bitbucket),
        branch: branch.to_string(),
        head_commit: head.to_string(),
        previous_commit: previous,
        commits,
    })
}

fn bitbucket_pull_request(payload: &Value) -> Result<Trigger> {
    let pr = &payload["pullrequest"];
    let repo = required(&payload["repository"]["full_name"], "repository.full_name")?;
    let source_branch = required(&pr["source"]["branch"]["name"], "source.branch.name")?;
    let source_commit = required(&pr["source"]["commit"]["hash"], "source.commit.hash")?;
    let pr_id = pr["id"]
        .as_i64()
        .ok_or_else(|| Error::NoBuildEvent("payload is missing pullrequest.id".to_string()))?;

    let links = &pr["links"];
    Ok(Trigger::PullRequest {
        repo: repo.to_string(),
        vcs_type: Some(SubCredType::Bitbucket),
        source_branch: source_branch.to_string(),
        source_commit: source_commit.to_string(),
        destination_branch: pr["destination"]["branch"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        destination_commit: pr["destination"]["commit"]["hash"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        pr_id,
        urls: PrUrls {
            commits: href(links, "commits"),
            comments: href(links, "comments"),
            statuses: href(links, "statuses"),
            approve: href(links, "approve"),
            decline: href(links, "decline"),
            merge: href(links, "merge"),
        },
    })
}

fn github_push(payload: &Value) -> Result<Trigger> {
    let repo = required(&payload["repository"]["full_name"], "repository.full_name")?;
    let after = required(&payload["after"], "after")?;
    if payload["deleted"].as_bool().unwrap_or(false) || is_null_sha(after) {
        return Err(Error::NoBuildEvent(format!("branch deleted in {repo}")));
    }
    // Tags and other refs carry no branch.
    let branch = payload["ref"]
        .as_str()
        .unwrap_or_default()
        .strip_prefix("refs/heads/")
        .unwrap_or_default();

    let commits = payload["commits"]
        .as_array()
        .map(|list| {
            list.iter()
                .map(|c| Commit {
                    hash: c["id"].as_str().unwrap_or_default().to_string(),
                    message: c["message"].as_str().unwrap_or_default().to_string(),
                    author: c["author"]["name"].as_str().unwrap_or_default().to_string(),
                    date: timestamp(&c["timestamp"]),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Trigger::Push {
        repo: repo.to_string(),
        vcs_type: Some(SubCredType::Github),
        branch: branch.to_string(),
        head_commit: after.to_string(),
        previous_commit: optional(&payload["before"]),
        commits,
    })
}

fn github_pull_request(payload: &Value) -> Result<Trigger> {
    let action = payload["action"].as_str().unwrap_or_default();
    if action != "opened" && action != "synchronize" && action != "reopened" {
        return Err(Error::NoBuildEvent(format!(
            "pull request action {action} does not build"
        )));
    }

    let pr = &payload["pull_request"];
    let repo = required(&payload["repository"]["full_name"], "repository.full_name")?;
    let source_branch = required(&pr["head"]["ref"], "pull_request.head.ref")?;
    let source_commit = required(&pr["head"]["sha"], "pull_request.head.sha")?;
    let pr_id = payload["number"]
        .as_i64()
        .ok_or_else(|| Error::NoBuildEvent("payload is missing number".to_string()))?;

    let api_url = pr["url"].as_str().unwrap_or_default();
    Ok(Trigger::PullRequest {
        repo: repo.to_string(),
        vcs_type: Some(SubCredType::Github),
        source_branch: source_branch.to_string(),
        source_commit: source_commit.to_string(),
        destination_branch: pr["base"]["ref"].as_str().unwrap_or_default().to_string(),
        destination_commit: pr["base"]["sha"].as_str().unwrap_or_default().to_string(),
        pr_id,
        urls: PrUrls {
            commits: pr["commits_url"].as_str().unwrap_or_default().to_string(),
            comments: pr["comments_url"].as_str().unwrap_or_default().to_string(),
            statuses: pr["statuses_url"].as_str().unwrap_or_default().to_string(),
            approve: format!("{api_url}/reviews"),
            decline: api_url.to_string(),
            merge: format!("{api_url}/merge"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bb_push(changes: Value) -> Value {
        json!({
            "push": { "changes": changes },
            "repository": { "full_name": "acme/widgets" }
        })
    }

    #[test]
    fn bitbucket_push_translates_head_and_previous() {
        let payload = bb_push(json!([{
            "new": { "type": "branch", "name": "main", "target": { "hash": "c3" } },
            "old": { "type": "branch", "name": "main", "target": { "hash": "c1" } },
            "commits": [
                { "hash": "c3", "message": "three", "author": { "raw": "Dev <d@x>" }, "date": "2024-01-02T03:04:05+00:00" },
                { "hash": "c2", "message": "two", "author": { "raw": "Dev <d@x>" } }
            ]
        }]));
        let trigger = bitbucket_event("repo:push", &payload).unwrap();
        match trigger {
            Trigger::Push {
                repo,
                branch,
                head_commit,
                previous_commit,
                commits,
                ..
            } => {
                assert_eq!(repo, "acme/widgets");
                assert_eq!(branch, "main");
                assert_eq!(head_commit, "c3");
                assert_eq!(previous_commit.as_deref(), Some("c1"));
                assert_eq!(commits.len(), 2);
                assert!(commits[0].date.is_some());
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn bitbucket_push_without_old_uses_last_commit() {
        let payload = bb_push(json!([{
            "new": { "type": "branch", "name": "feature", "target": { "hash": "c3" } },
            "old": null,
            "commits": [ { "hash": "c3", "message": "m" }, { "hash": "c2", "message": "m" } ]
        }]));
        match bitbucket_event("repo:push", &payload).unwrap() {
            Trigger::Push { previous_commit, .. } => {
                assert_eq!(previous_commit.as_deref(), Some("c2"))
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn bitbucket_push_edge_cases() {
        let empty = bitbucket_event("repo:push", &bb_push(json!([]))).unwrap_err();
        assert!(matches!(empty, Error::NoBuildEvent(ref m) if m == "no commits found in push"));

        let two = bb_push(json!([{ "new": null }, { "new": null }]));
        assert!(matches!(
            bitbucket_event("repo:push", &two),
            Err(Error::Validation(ref m)) if m == "too many changesets"
        ));

        let deleted = bb_push(json!([{ "new": null, "old": { "target": { "hash": "c1" } } }]));
        assert!(bitbucket_event("repo:push", &deleted).unwrap_err().is_silent());

        let tag = bb_push(json!([{ "new": { "type": "tag", "name": "v1", "target": { "hash": "c1" } } }]));
        assert!(bitbucket_event("repo:push", &tag).unwrap_err().is_silent());
    }

    #[test]
    fn bitbucket_pull_request_carries_links() {
        let payload = json!({
            "pullrequest": {
                "id": 12,
                "source": { "branch": { "name": "feature" }, "commit": { "hash": "s1" } },
                "destination": { "branch": { "name": "main" }, "commit": { "hash": "d1" } },
                "links": {
                    "commits": { "href": "https://bb/commits" },
                    "comments": { "href": "https://bb/comments" },
                    "statuses": { "href": "https://bb/statuses" },
                    "approve": { "href": "https://bb/approve" },
                    "decline": { "href": "https://bb/decline" },
                    "merge": { "href": "https://bb/merge" }
                }
            },
            "repository": { "full_name": "acme/widgets" }
        });
        match bitbucket_event("pullrequest:updated", &payload).unwrap() {
            Trigger::PullRequest {
                pr_id,
                source_commit,
                destination_commit,
                urls,
                ..
            } => {
                assert_eq!(pr_id, 12);
                assert_eq!(source_commit, "s1");
                assert_eq!(destination_commit, "d1");
                assert_eq!(urls.merge, "https://bb/merge");
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn unknown_events_are_unsupported() {
        let err = bitbucket_event("repo:fork", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedEvent(_)));
        let err = github_event("issues", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedEvent(_)));
    }

    #[test]
    fn github_push_and_tag() {
        let payload = json!({
            "ref": "refs/heads/main",
            "before": "0000000000000000000000000000000000000000",
            "after": "abc",
            "repository": { "full_name": "acme/widgets" },
            "commits": [ { "id": "abc", "message": "first", "author": { "name": "dev" } } ]
        });
        match github_event("push", &payload).unwrap() {
            Trigger::Push {
                branch,
                previous_commit,
                ..
            } => {
                assert_eq!(branch, "main");
                assert_eq!(previous_commit, None);
            }
            other => panic!("unexpected trigger {other:?}"),
        }

        let mut tag = payload.clone();
        tag["ref"] = json!("refs/tags/v1.0");
        match github_event("push", &tag).unwrap() {
            Trigger::Push { branch, .. } => assert_eq!(branch, ""),
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn github_branch_delete_is_nothing_to_do() {
        let payload = json!({
            "ref": "refs/heads/gone",
            "after": "0000000000000000000000000000000000000000",
            "deleted": true,
            "repository": { "full_name": "acme/widgets" }
        });
        assert!(github_event("push", &payload).unwrap_err().is_silent());
    }

    #[test]
    fn github_pull_request_filters_actions() {
        let mut payload = json!({
            "action": "closed",
            "number": 7,
            "pull_request": {
                "url": "https://api.github.com/repos/acme/widgets/pulls/7",
                "head": { "ref": "feature", "sha": "h1" },
                "base": { "ref": "main", "sha": "b1" }
            },
            "repository": { "full_name": "acme/widgets" }
        });
        assert!(github_event("pull_request", &payload).unwrap_err().is_silent());

        payload["action"] = json!("synchronize");
        match github_event("pull_request", &payload).unwrap() {
            Trigger::PullRequest { pr_id, urls, .. } => {
                assert_eq!(pr_id, 7);
                assert!(urls.merge.ends_with("/pulls/7/merge"));
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn missing_nested_fields_are_nothing_to_do() {
        let payload = json!({ "after": "abc", "ref": "refs/heads/main" });
        let err = github_event("push", &payload).unwrap_err();
        assert!(matches!(err, Error::NoBuildEvent(ref m) if m.contains("repository.full_name")));
    }

    #[test]
    fn undecodable_body_is_validation() {
        let err = translate(SubCredType::Github, "push", b"not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
