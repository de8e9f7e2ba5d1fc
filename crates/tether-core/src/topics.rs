//! # Topics Module
//!
//! Construction and parsing of the reserved shadow and job topics, plus MQTT
//! topic-filter matching.
//!
//! ## Topic Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  <prefix>/things/<thing>/shadow/get            ◄── device publishes     │
//! │  <prefix>/things/<thing>/shadow/get/accepted   ──► device receives      │
//! │  <prefix>/things/<thing>/shadow/get/rejected                            │
//! │  <prefix>/things/<thing>/shadow/update         (same pattern)           │
//! │  <prefix>/things/<thing>/shadow/update/delta   ──► desired ≠ reported   │
//! │  <prefix>/things/<thing>/shadow/delete         (same pattern)           │
//! │                                                                         │
//! │  <prefix>/things/<thing>/jobs/notify-next      ──► next pending job     │
//! │  <prefix>/things/<thing>/jobs/notify           ──► pending list changed │
//! │  <prefix>/things/<thing>/jobs/get[/accepted|/rejected]                  │
//! │  <prefix>/things/<thing>/jobs/$next/get[/accepted|/rejected]            │
//! │  <prefix>/things/<thing>/jobs/<jobId>/get[/accepted|/rejected]          │
//! │  <prefix>/things/<thing>/jobs/<jobId>/update[/accepted|/rejected]       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! These strings are a wire contract with the cloud services and existing
//! deployments. Do not change them.

use std::fmt;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Topic Kinds
// =============================================================================

/// The three request types a shadow supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowOperation {
    Get,
    Update,
    Delete,
}

impl ShadowOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowOperation::Get => "get",
            ShadowOperation::Update => "update",
            ShadowOperation::Delete => "delete",
        }
    }

    fn parse(level: &str) -> Option<Self> {
        match level {
            "get" => Some(ShadowOperation::Get),
            "update" => Some(ShadowOperation::Update),
            "delete" => Some(ShadowOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ShadowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome suffix of a service response topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Accepted,
    Rejected,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Accepted => "accepted",
            ResponseStatus::Rejected => "rejected",
        }
    }

    fn parse(level: &str) -> Option<Self> {
        match level {
            "accepted" => Some(ResponseStatus::Accepted),
            "rejected" => Some(ResponseStatus::Rejected),
            _ => None,
        }
    }
}

/// A parsed shadow topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowTopic {
    /// `shadow/<op>`
    Request(ShadowOperation),
    /// `shadow/<op>/accepted|rejected`
    Response(ShadowOperation, ResponseStatus),
    /// `shadow/update/delta`
    Delta,
}

/// The request endpoints of the jobs service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    /// `jobs/get`: list pending executions.
    GetPending,
    /// `jobs/$next/get`: describe the next pending execution.
    GetNext,
    /// `jobs/<jobId>/get`
    Describe(String),
    /// `jobs/<jobId>/update`
    Update(String),
}

/// A parsed job topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTopic {
    NotifyNext,
    Notify,
    Request(JobRequest),
    Response(JobRequest, ResponseStatus),
}

/// Shadow or job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Shadow(ShadowTopic),
    Job(JobTopic),
}

/// A reserved topic split into its thing name and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingTopic {
    pub thing_name: String,
    pub kind: TopicKind,
}

// =============================================================================
// Topic Builder
// =============================================================================

/// Builds and parses reserved topics under a fixed prefix.
///
/// ## Example
/// ```rust
/// use tether_core::topics::{ShadowOperation, Topics};
///
/// let topics = Topics::new("$aws");
/// assert_eq!(
///     topics.shadow_request("lamp", ShadowOperation::Update),
///     "$aws/things/lamp/shadow/update"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TOPIC_PREFIX)
    }
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Topics {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn thing_root(&self, thing_name: &str) -> String {
        format!("{}/things/{}", self.prefix, thing_name)
    }

    // -------------------------------------------------------------------------
    // Shadow
    // -------------------------------------------------------------------------

    pub fn shadow_request(&self, thing_name: &str, op: ShadowOperation) -> String {
        format!("{}/shadow/{}", self.thing_root(thing_name), op)
    }

    pub fn shadow_response(
        &self,
        thing_name: &str,
        op: ShadowOperation,
        status: ResponseStatus,
    ) -> String {
        format!("{}/{}", self.shadow_request(thing_name, op), status.as_str())
    }

    pub fn shadow_delta(&self, thing_name: &str) -> String {
        format!("{}/shadow/update/delta", self.thing_root(thing_name))
    }

    /// Every response topic a registered shadow listens on, in subscription
    /// order. The delta topic is left out when `include_delta` is false.
    pub fn shadow_filters(&self, thing_name: &str, include_delta: bool) -> Vec<String> {
        let mut filters = Vec::with_capacity(7);
        for op in [
            ShadowOperation::Get,
            ShadowOperation::Update,
            ShadowOperation::Delete,
        ] {
            for status in [ResponseStatus::Accepted, ResponseStatus::Rejected] {
                filters.push(self.shadow_response(thing_name, op, status));
            }
        }
        if include_delta {
            filters.push(self.shadow_delta(thing_name));
        }
        filters
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    pub fn jobs_notify_next(&self, thing_name: &str) -> String {
        format!("{}/jobs/notify-next", self.thing_root(thing_name))
    }

    pub fn jobs_notify(&self, thing_name: &str) -> String {
        format!("{}/jobs/notify", self.thing_root(thing_name))
    }

    pub fn job_request(&self, thing_name: &str, request: &JobRequest) -> String {
        let root = self.thing_root(thing_name);
        match request {
            JobRequest::GetPending => format!("{}/jobs/get", root),
            JobRequest::GetNext => format!("{}/jobs/$next/get", root),
            JobRequest::Describe(job_id) => format!("{}/jobs/{}/get", root, job_id),
            JobRequest::Update(job_id) => format!("{}/jobs/{}/update", root, job_id),
        }
    }

    pub fn job_response(
        &self,
        thing_name: &str,
        request: &JobRequest,
        status: ResponseStatus,
    ) -> String {
        format!(
            "{}/{}",
            self.job_request(thing_name, request),
            status.as_str()
        )
    }

    /// Wildcard filters covering every jobs response for a thing.
    pub fn job_response_filters(&self, thing_name: &str) -> Vec<String> {
        let root = self.thing_root(thing_name);
        vec![
            format!("{}/jobs/get/+", root),
            format!("{}/jobs/+/get/+", root),
            format!("{}/jobs/+/update/+", root),
        ]
    }

    // -------------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------------

    /// Parses a reserved topic.
    ///
    /// Returns `CoreError::InvalidTopic` for anything outside the shadow and
    /// jobs namespaces, including plain application topics.
    pub fn parse(&self, topic: &str) -> CoreResult<ThingTopic> {
        let invalid = || CoreError::InvalidTopic(topic.to_string());

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix("/things/"))
            .ok_or_else(invalid)?;

        let levels: Vec<&str> = rest.split('/').collect();
        let (thing_name, service, tail) = match levels.as_slice() {
            [thing, service, tail @ ..] if !thing.is_empty() => (*thing, *service, tail),
            _ => return Err(invalid()),
        };

        let kind = match service {
            "shadow" => TopicKind::Shadow(parse_shadow(tail).ok_or_else(invalid)?),
            "jobs" => TopicKind::Job(parse_jobs(tail).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };

        Ok(ThingTopic {
            thing_name: thing_name.to_string(),
            kind,
        })
    }
}

fn parse_shadow(tail: &[&str]) -> Option<ShadowTopic> {
    match tail {
        [op] => ShadowOperation::parse(op).map(ShadowTopic::Request),
        ["update", "delta"] => Some(ShadowTopic::Delta),
        [op, status] => Some(ShadowTopic::Response(
            ShadowOperation::parse(op)?,
            ResponseStatus::parse(status)?,
        )),
        _ => None,
    }
}

fn parse_jobs(tail: &[&str]) -> Option<JobTopic> {
    let with_status = |request: JobRequest, status: Option<&&str>| match status {
        None => Some(JobTopic::Request(request)),
        Some(s) => Some(JobTopic::Response(request, ResponseStatus::parse(s)?)),
    };

    match tail {
        ["notify-next"] => Some(JobTopic::NotifyNext),
        ["notify"] => Some(JobTopic::Notify),
        ["get", status @ ..] if status.len() <= 1 => {
            with_status(JobRequest::GetPending, status.first())
        }
        ["$next", "get", status @ ..] if status.len() <= 1 => {
            with_status(JobRequest::GetNext, status.first())
        }
        [job_id, "get", status @ ..] if status.len() <= 1 => {
            with_status(JobRequest::Describe(job_id.to_string()), status.first())
        }
        [job_id, "update", status @ ..] if status.len() <= 1 => {
            with_status(JobRequest::Update(job_id.to_string()), status.first())
        }
        _ => None,
    }
}

// =============================================================================
// Filter Matching
// =============================================================================

/// Returns true when `topic` matches the MQTT subscription `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it. Wildcards in the first level never match topics that
/// start with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("$aws")
    }

    #[test]
    fn test_shadow_topic_strings() {
        let t = topics();
        assert_eq!(
            t.shadow_request("lamp", ShadowOperation::Get),
            "$aws/things/lamp/shadow/get"
        );
        assert_eq!(
            t.shadow_response("lamp", ShadowOperation::Delete, ResponseStatus::Rejected),
            "$aws/things/lamp/shadow/delete/rejected"
        );
        assert_eq!(t.shadow_delta("lamp"), "$aws/things/lamp/shadow/update/delta");
    }

    #[test]
    fn test_shadow_filters_respect_delta_flag() {
        let t = topics();
        let with = t.shadow_filters("lamp", true);
        let without = t.shadow_filters("lamp", false);
        assert_eq!(with.len(), 7);
        assert_eq!(without.len(), 6);
        assert!(with.contains(&"$aws/things/lamp/shadow/update/delta".to_string()));
        assert!(!without.iter().any(|f| f.ends_with("/delta")));
        assert_eq!(with[0], "$aws/things/lamp/shadow/get/accepted");
    }

    #[test]
    fn test_job_topic_strings() {
        let t = topics();
        assert_eq!(t.jobs_notify_next("pump"), "$aws/things/pump/jobs/notify-next");
        assert_eq!(
            t.job_request("pump", &JobRequest::GetNext),
            "$aws/things/pump/jobs/$next/get"
        );
        assert_eq!(
            t.job_response(
                "pump",
                &JobRequest::Update("job-1".to_string()),
                ResponseStatus::Accepted
            ),
            "$aws/things/pump/jobs/job-1/update/accepted"
        );
    }

    #[test]
    fn test_prefix_trailing_slash_is_trimmed() {
        let t = Topics::new("custom/");
        assert_eq!(
            t.shadow_request("a", ShadowOperation::Get),
            "custom/things/a/shadow/get"
        );
    }

    #[test]
    fn test_parse_shadow_topics() {
        let t = topics();
        let parsed = t.parse("$aws/things/lamp/shadow/update/accepted").unwrap();
        assert_eq!(parsed.thing_name, "lamp");
        assert_eq!(
            parsed.kind,
            TopicKind::Shadow(ShadowTopic::Response(
                ShadowOperation::Update,
                ResponseStatus::Accepted
            ))
        );

        let delta = t.parse("$aws/things/lamp/shadow/update/delta").unwrap();
        assert_eq!(delta.kind, TopicKind::Shadow(ShadowTopic::Delta));

        let request = t.parse("$aws/things/lamp/shadow/get").unwrap();
        assert_eq!(
            request.kind,
            TopicKind::Shadow(ShadowTopic::Request(ShadowOperation::Get))
        );
    }

    #[test]
    fn test_parse_job_topics() {
        let t = topics();
        assert_eq!(
            t.parse("$aws/things/pump/jobs/notify-next").unwrap().kind,
            TopicKind::Job(JobTopic::NotifyNext)
        );
        assert_eq!(
            t.parse("$aws/things/pump/jobs/$next/get/accepted").unwrap().kind,
            TopicKind::Job(JobTopic::Response(
                JobRequest::GetNext,
                ResponseStatus::Accepted
            ))
        );
        assert_eq!(
            t.parse("$aws/things/pump/jobs/j-9/update/rejected").unwrap().kind,
            TopicKind::Job(JobTopic::Response(
                JobRequest::Update("j-9".to_string()),
                ResponseStatus::Rejected
            ))
        );
        assert_eq!(
            t.parse("$aws/things/pump/jobs/j-9/update").unwrap().kind,
            TopicKind::Job(JobTopic::Request(JobRequest::Update("j-9".to_string())))
        );
        assert_eq!(
            t.parse("$aws/things/pump/jobs/get/accepted").unwrap().kind,
            TopicKind::Job(JobTopic::Response(
                JobRequest::GetPending,
                ResponseStatus::Accepted
            ))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        let t = topics();
        assert!(t.parse("sensors/temp").is_err());
        assert!(t.parse("$aws/things//shadow/get").is_err());
        assert!(t.parse("$aws/things/lamp/shadow/update/sideways").is_err());
        assert!(t.parse("$aws/things/lamp/unknown/get").is_err());
        assert!(t.parse("$aws/things/lamp/jobs/a/b/c/d").is_err());
        assert!(Topics::new("other").parse("$aws/things/lamp/shadow/get").is_err());
    }

    #[test]
    fn test_topic_matches_exact_and_wildcards() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(!topic_matches("a/+/c", "a/x/y/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("a/+", "a/"));
    }

    #[test]
    fn test_topic_matches_dollar_topics() {
        assert!(!topic_matches("#", "$aws/things/x/shadow/get"));
        assert!(!topic_matches("+/things/x/shadow/get", "$aws/things/x/shadow/get"));
        assert!(topic_matches("$aws/things/+/shadow/#", "$aws/things/x/shadow/get"));
    }

    #[test]
    fn test_job_response_filters_match_responses() {
        let t = topics();
        let filters = t.job_response_filters("pump");
        let hit = |topic: &str| filters.iter().any(|f| topic_matches(f, topic));
        assert!(hit("$aws/things/pump/jobs/$next/get/accepted"));
        assert!(hit("$aws/things/pump/jobs/j-1/update/rejected"));
        assert!(hit("$aws/things/pump/jobs/get/accepted"));
        assert!(!hit("$aws/things/other/jobs/j-1/update/rejected"));
        assert!(!hit("$aws/things/pump/jobs/notify-next"));
    }
}
