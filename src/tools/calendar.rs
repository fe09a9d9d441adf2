use chrono::DateTime;
use serde_json::{json, Map, Value};

use super::{content_type, optional_str, required_str, ToolContext, ToolHandler};
use crate::error::ToolError;

pub const TEAMS_PROVIDER: &str = "teamsForBusiness";
const DEFAULT_TIME_ZONE: &str = "UTC";

/// `calendar.events.list`
pub struct ListEvents;

/// `calendar.event.create`
pub struct CreateEvent;

#[async_trait::async_trait]
impl ToolHandler for ListEvents {
    fn name(&self) -> &'static str {
        "calendar.events.list"
    }

    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let start = required_str(&input, "startDateTime")?;
        let end = required_str(&input, "endDateTime")?;
        check_window(&start, &end)?;

        let events = ctx.client.list_calendar_events(&start, &end).await?;
        let shaped: Vec<Value> = events.iter().map(shape_event).collect();
        Ok(json!({
            "startDateTime": start,
            "endDateTime": end,
            "count": shaped.len(),
            "events": shaped,
        }))
    }
}

#[async_trait::async_trait]
impl ToolHandler for CreateEvent {
    fn name(&self) -> &'static str {
        "calendar.event.create"
    }

    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let payload = build_event_payload(&input)?;
        let created = ctx.client.create_calendar_event(payload).await?;
        log::info!(
            "calendar.event.create: created event {}",
            created["id"].as_str().unwrap_or("?")
        );
        Ok(json!({
            "status": "created",
            "id": created["id"],
            "subject": created["subject"],
            "webLink": created["webLink"],
            "joinUrl": created["onlineMeeting"]["joinUrl"],
        }))
    }
}

/// Rejects windows whose end precedes their start. Values that are not
/// RFC 3339 are left for the API to judge.
fn check_window(start: &str, end: &str) -> Result<(), ToolError> {
    if let (Ok(s), Ok(e)) = (DateTime::parse_from_rfc3339(start), DateTime::parse_from_rfc3339(end)) {
        if e < s {
            return Err(ToolError::validation(format!(
                "endDateTime {end} is before startDateTime {start}"
            )));
        }
    }
    Ok(())
}

/// Event body for `POST /me/events`.
///
/// `teams: true` forces an online Teams meeting regardless of any explicit
/// `isOnlineMeeting` / `onlineMeetingProvider` values.
pub fn build_event_payload(input: &Map<String, Value>) -> Result<Value, ToolError> {
    let subject = required_str(input, "subject")?;
    let start = required_str(input, "startDateTime")?;
    let end = required_str(input, "endDateTime")?;
    check_window(&start, &end)?;
    let time_zone = optional_str(input, "timeZone").unwrap_or_else(|| DEFAULT_TIME_ZONE.to_string());
    let content_type = content_type(input)?;

    let mut event = Map::new();
    event.insert("subject".into(), json!(subject));
    event.insert("start".into(), json!({ "dateTime": start, "timeZone": time_zone }));
    event.insert("end".into(), json!({ "dateTime": end, "timeZone": time_zone }));

    if let Some(body) = optional_str(input, "body") {
        event.insert(
            "body".into(),
            json!({ "contentType": content_type, "content": body }),
        );
    }
    if let Some(location) = optional_str(input, "location") {
        event.insert("location".into(), json!({ "displayName": location }));
    }

    let attendees = normalize_attendees(input.get("attendees"));
    if !attendees.is_empty() {
        event.insert("attendees".into(), Value::Array(attendees));
    }

    if input.get("teams").and_then(Value::as_bool).unwrap_or(false) {
        event.insert("isOnlineMeeting".into(), json!(true));
        event.insert("onlineMeetingProvider".into(), json!(TEAMS_PROVIDER));
    } else {
        if let Some(online) = input.get("isOnlineMeeting").and_then(Value::as_bool) {
            event.insert("isOnlineMeeting".into(), json!(online));
        }
        if let Some(provider) = optional_str(input, "onlineMeetingProvider") {
            event.insert("onlineMeetingProvider".into(), json!(provider));
        }
    }

    Ok(Value::Object(event))
}

/// Accepts plain addresses or `{address|email, name, type}` objects; entries
/// without an address are dropped.
fn normalize_attendees(raw: Option<&Value>) -> Vec<Value> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let (address, name, kind) = match item {
                Value::String(s) => (Some(s.trim().to_string()), None, None),
                Value::Object(obj) => (
                    optional_str(obj, "address").or_else(|| optional_str(obj, "email")),
                    optional_str(obj, "name"),
                    optional_str(obj, "type"),
                ),
                _ => (None, None, None),
            };
            let address = address.filter(|a| !a.is_empty())?;
            let mut email = Map::new();
            email.insert("address".into(), json!(address));
            if let Some(name) = name {
                email.insert("name".into(), json!(name));
            }
            Some(json!({
                "emailAddress": email,
                "type": kind.unwrap_or_else(|| "required".to_string()),
            }))
        })
        .collect()
}

fn shape_event(event: &Value) -> Value {
    let attendees: Vec<Value> = event["attendees"]
        .as_array()
        .map(|list| {
            list.iter()
                .map(|a| a["emailAddress"]["address"].clone())
                .collect()
        })
        .unwrap_or_default();

    json!({
        "id": event["id"],
        "subject": event["subject"],
        "start": event["start"],
        "end": event["end"],
        "location": event["location"]["displayName"],
        "organizer": event["organizer"]["emailAddress"]["address"],
        "attendees": attendees,
        "isOnlineMeeting": event["isOnlineMeeting"],
        "joinUrl": event["onlineMeeting"]["joinUrl"],
        "webLink": event["webLink"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_client;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx(server: &MockServer) -> ToolContext {
        ToolContext {
            client: Arc::new(test_client(&server.uri())),
            sandbox_root: None,
            reply_redirect: None,
        }
    }

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_teams_overrides_online_meeting_settings() {
        let payload = build_event_payload(&input(json!({
            "subject": "S",
            "startDateTime": "2024-01-01T09:00:00Z",
            "endDateTime": "2024-01-01T10:00:00Z",
            "teams": true,
            "isOnlineMeeting": false,
            "onlineMeetingProvider": "skypeForBusiness"
        })))
        .unwrap();
        assert_eq!(payload["isOnlineMeeting"], true);
        assert_eq!(payload["onlineMeetingProvider"], TEAMS_PROVIDER);
    }

    #[test]
    fn test_explicit_online_settings_without_teams() {
        let payload = build_event_payload(&input(json!({
            "subject": "S",
            "startDateTime": "2024-01-01T09:00:00Z",
            "endDateTime": "2024-01-01T10:00:00Z",
            "isOnlineMeeting": false
        })))
        .unwrap();
        assert_eq!(payload["isOnlineMeeting"], false);
        assert!(payload.get("onlineMeetingProvider").is_none());
        assert_eq!(payload["start"]["timeZone"], "UTC");
    }

    #[test]
    fn test_attendees_are_normalized() {
        let payload = build_event_payload(&input(json!({
            "subject": "Review",
            "startDateTime": "2024-01-01T09:00:00Z",
            "endDateTime": "2024-01-01T10:00:00Z",
            "attendees": [
                "ann@example.com",
                { "address": "bob@example.com", "name": "Bob", "type": "optional" },
                { "email": "cy@example.com" },
                { "name": "No Address" },
                "  ",
                42
            ]
        })))
        .unwrap();
        let attendees = payload["attendees"].as_array().unwrap();
        assert_eq!(attendees.len(), 3);
        assert_eq!(attendees[0]["emailAddress"]["address"], "ann@example.com");
        assert_eq!(attendees[0]["type"], "required");
        assert_eq!(attendees[1]["emailAddress"]["name"], "Bob");
        assert_eq!(attendees[1]["type"], "optional");
        assert_eq!(attendees[2]["emailAddress"]["address"], "cy@example.com");
    }

    #[test]
    fn test_create_requires_subject_and_bounds() {
        let missing_subject = build_event_payload(&input(json!({
            "startDateTime": "2024-01-01T09:00:00Z",
            "endDateTime": "2024-01-01T10:00:00Z"
        })));
        assert!(matches!(missing_subject, Err(ToolError::Validation(_))));

        let missing_end = build_event_payload(&input(json!({
            "subject": "S",
            "startDateTime": "2024-01-01T09:00:00Z"
        })));
        assert!(matches!(missing_end, Err(ToolError::Validation(_))));
    }

    #[test]
    fn test_body_content_type_uses_manifest_spelling() {
        let base = json!({
            "subject": "S",
            "startDateTime": "2024-01-01T09:00:00Z",
            "endDateTime": "2024-01-01T10:00:00Z",
            "body": "<b>agenda</b>"
        });
        let mut html = input(base.clone());
        html.insert("contentType".into(), json!("HTML"));
        let payload = build_event_payload(&html).unwrap();
        assert_eq!(payload["body"]["contentType"], "HTML");

        let mut lowercase = input(base);
        lowercase.insert("contentType".into(), json!("html"));
        assert!(matches!(
            build_event_payload(&lowercase),
            Err(ToolError::Validation(_))
        ));
    }

    #[test]
    fn test_window_must_not_be_inverted() {
        assert!(check_window("2024-01-02T00:00:00Z", "2024-01-01T00:00:00Z").is_err());
        assert!(check_window("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z").is_ok());
        assert!(check_window("2024-01-02T00:00", "2024-01-01T00:00").is_ok());
    }

    #[tokio::test]
    async fn test_list_events_requires_both_bounds() {
        let server = MockServer::start().await;
        let err = ListEvents
            .run(input(json!({ "startDateTime": "2024-01-01T00:00:00Z" })), &ctx(&server))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("endDateTime"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_events_uses_calendar_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/calendarView"))
            .and(query_param("startDateTime", "2024-01-01T00:00:00Z"))
            .and(query_param("endDateTime", "2024-01-08T00:00:00Z"))
            .and(query_param("$orderby", "start/dateTime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "id": "e1", "subject": "Standup", "location": { "displayName": "Room 1" } },
                    { "id": "e2", "subject": "Review" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = ListEvents
            .run(
                input(json!({
                    "startDateTime": "2024-01-01T00:00:00Z",
                    "endDateTime": "2024-01-08T00:00:00Z"
                })),
                &ctx(&server),
            )
            .await
            .unwrap();
        assert_eq!(result["count"], 2);
        assert_eq!(result["events"][0]["location"], "Room 1");
        assert_eq!(result["events"][1]["id"], "e2");
    }

    #[tokio::test]
    async fn test_create_event_returns_join_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/events"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "e7",
                "subject": "Site visit",
                "webLink": "https://outlook.example/e7",
                "onlineMeeting": { "joinUrl": "https://teams.example/join/e7" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = CreateEvent
            .run(
                input(json!({
                    "subject": "Site visit",
                    "startDateTime": "2024-03-01T09:00:00Z",
                    "endDateTime": "2024-03-01T10:00:00Z",
                    "teams": true
                })),
                &ctx(&server),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "created");
        assert_eq!(result["joinUrl"], "https://teams.example/join/e7");
    }
}
