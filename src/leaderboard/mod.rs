use crate::config::{GameConfig, LeaderboardConfig};
use crate::states::{GameState, RunSummary};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::thread::JoinHandle;
use std::time::Duration;

const API_BASE_URL_ENV: &str = "ONCOMING_API_BASE_URL";
const API_KEY_ENV: &str = "ONCOMING_API_KEY";
const ACCOUNT_EMAIL_ENV: &str = "ONCOMING_EMAIL";
const ACCOUNT_PASSWORD_ENV: &str = "ONCOMING_PASSWORD";
const DEFAULT_API_BASE_URL: &str = "https://leaderboard.oncoming.dev";
const CURL_CONNECT_TIMEOUT_SECONDS: u32 = 4;
const CURL_REQUEST_TIMEOUT_SECONDS: u32 = 10;

pub struct LeaderboardPlugin;

impl Plugin for LeaderboardPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<LeaderboardState>()
            .add_systems(OnEnter(GameState::Results), begin_results_session)
            .add_systems(
                Update,
                run_leaderboard_session
                    .run_if(in_state(GameState::Results))
                    .run_if(resource_exists::<GameConfig>),
            );
    }
}

/// Subscription gate for the Results screen: leaderboard panel when
/// granted, subscribe prompt otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessGate {
    Unknown,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    CheckingAccess,
    SubmittingScore,
    Subscribing,
    Settled,
}

#[derive(Debug)]
enum WorkerOutcome {
    SignIn(Result<String, String>),
    FlagRead(Result<Option<bool>, String>),
    FlagWrite(Result<(), String>),
    ScoreSubmit(Result<(), String>),
}

#[derive(Debug)]
struct InFlightRequest {
    label: &'static str,
    started_at_s: f64,
    handle: JoinHandle<WorkerOutcome>,
}

#[derive(Resource, Debug)]
pub struct LeaderboardState {
    pub user_id: Option<String>,
    pub access: AccessGate,
    pub status: String,
    pub score_submitted: bool,
    phase: SessionPhase,
    pending_score: u32,
    inflight: Option<InFlightRequest>,
}

impl Default for LeaderboardState {
    fn default() -> Self {
        Self {
            user_id: None,
            access: AccessGate::Unknown,
            status: "idle".to_string(),
            score_submitted: false,
            phase: SessionPhase::Idle,
            pending_score: 0,
            inflight: None,
        }
    }
}

fn begin_results_session(
    config: Res<GameConfig>,
    run_summary: Res<RunSummary>,
    mut state: ResMut<LeaderboardState>,
) {
    // A request left over from a previous visit finishes detached; its
    // result no longer matters.
    state.inflight = None;
    state.access = AccessGate::Unknown;
    state.phase = SessionPhase::Idle;
    state.pending_score = run_summary.score;
    state.score_submitted = false;

    if !config.leaderboard.leaderboard.enabled {
        state.access = AccessGate::Denied;
        state.phase = SessionPhase::Settled;
        state.status = "leaderboard disabled in config".to_string();
        return;
    }

    state.status = "checking leaderboard access...".to_string();
}

/// One non-blocking step of the auth/leaderboard session per tick. Worker
/// threads carry every network call; this system only polls handles,
/// applies outcomes, and starts the next request.
fn run_leaderboard_session(
    time: Res<Time>,
    keyboard: Res<ButtonInput<KeyCode>>,
    config: Res<GameConfig>,
    mut state: ResMut<LeaderboardState>,
) {
    let now_s = time.elapsed_secs_f64();
    let settings = config.leaderboard.leaderboard.clone();

    if let Some(inflight) = state.inflight.as_ref() {
        if !inflight.handle.is_finished() {
            if now_s - inflight.started_at_s <= settings.request_timeout_seconds as f64 {
                return;
            }
            let Some(stale) = state.inflight.take() else {
                return;
            };
            state.status = format!("{} timed out; leaderboard unavailable", stale.label);
            if state.access != AccessGate::Granted {
                state.access = AccessGate::Denied;
            }
            state.phase = SessionPhase::Settled;
            return;
        }
    }

    if let Some(finished) = state.inflight.take() {
        match finished.handle.join() {
            Ok(outcome) => apply_worker_outcome(&mut state, outcome),
            Err(join_error) => {
                state.status = format!("leaderboard worker panicked ({join_error:?})");
                state.access = AccessGate::Denied;
                state.phase = SessionPhase::Settled;
            }
        }
    }

    if state.inflight.is_some() {
        return;
    }

    match state.phase {
        SessionPhase::Idle => kickoff_session(&mut state, &settings, now_s),
        SessionPhase::CheckingAccess => kickoff_access_check(&mut state, &settings, now_s),
        SessionPhase::SubmittingScore => kickoff_score_submit(&mut state, &settings, now_s),
        SessionPhase::Subscribing => kickoff_subscribe(&mut state, &settings, now_s),
        SessionPhase::Settled => {
            if state.access == AccessGate::Denied
                && state.user_id.is_some()
                && keyboard.just_pressed(KeyCode::KeyB)
            {
                state.phase = SessionPhase::Subscribing;
            }
        }
    }
}

fn apply_worker_outcome(state: &mut LeaderboardState, outcome: WorkerOutcome) {
    match outcome {
        WorkerOutcome::SignIn(Ok(user_id)) => {
            state.status = format!("signed in as {}", truncate(&user_id, 24));
            state.user_id = Some(user_id);
            state.phase = SessionPhase::CheckingAccess;
        }
        WorkerOutcome::SignIn(Err(error)) => {
            state.status = format!("sign-in failed: {}", truncate(&error, 140));
            state.access = AccessGate::Denied;
            state.phase = SessionPhase::Settled;
        }
        WorkerOutcome::FlagRead(Ok(flag)) => {
            state.access = access_from_flag(flag);
            if state.access == AccessGate::Granted {
                state.status = "subscription active".to_string();
                state.phase = SessionPhase::SubmittingScore;
            } else {
                state.status = "not subscribed".to_string();
                state.phase = SessionPhase::Settled;
            }
        }
        WorkerOutcome::FlagRead(Err(error)) => {
            state.status = format!("subscription check failed: {}", truncate(&error, 140));
            state.access = AccessGate::Denied;
            state.phase = SessionPhase::Settled;
        }
        WorkerOutcome::FlagWrite(Ok(())) => {
            state.status = "subscribed".to_string();
            state.phase = SessionPhase::CheckingAccess;
        }
        WorkerOutcome::FlagWrite(Err(error)) => {
            state.status = format!("subscribe failed: {}", truncate(&error, 140));
            state.phase = SessionPhase::Settled;
        }
        WorkerOutcome::ScoreSubmit(Ok(())) => {
            state.score_submitted = true;
            state.status = "score submitted".to_string();
            state.phase = SessionPhase::Settled;
        }
        WorkerOutcome::ScoreSubmit(Err(error)) => {
            state.status = format!("score submit failed: {}", truncate(&error, 140));
            state.phase = SessionPhase::Settled;
        }
    }
}

fn kickoff_session(state: &mut LeaderboardState, settings: &LeaderboardConfig, now_s: f64) {
    if state.user_id.is_some() {
        state.phase = SessionPhase::CheckingAccess;
        return;
    }

    let Some(endpoint) = service_endpoint_from_env() else {
        state.status = format!("{API_KEY_ENV} not set; leaderboard unavailable");
        state.access = AccessGate::Denied;
        state.phase = SessionPhase::Settled;
        return;
    };
    let Some((email, password)) = credentials_from_env() else {
        state.status =
            format!("{ACCOUNT_EMAIL_ENV}/{ACCOUNT_PASSWORD_ENV} not set; sign-in skipped");
        state.access = AccessGate::Denied;
        state.phase = SessionPhase::Settled;
        return;
    };

    let max_retries = settings.api_max_retries;
    let backoff_s = settings.retry_backoff_seconds;
    state.status = "signing in...".to_string();
    spawn_request(state, "sign-in", now_s, move || {
        WorkerOutcome::SignIn(with_retries(max_retries, backoff_s, || {
            request_sign_in(&endpoint, &email, &password)
        }))
    });
}

fn kickoff_access_check(state: &mut LeaderboardState, settings: &LeaderboardConfig, now_s: f64) {
    let Some(user_id) = state.user_id.clone() else {
        debug_assert!(false, "access check without a signed-in user");
        state.phase = SessionPhase::Settled;
        return;
    };
    let Some(endpoint) = service_endpoint_from_env() else {
        state.access = AccessGate::Denied;
        state.phase = SessionPhase::Settled;
        return;
    };

    let flag_key = settings.subscription_flag_key.clone();
    let max_retries = settings.api_max_retries;
    let backoff_s = settings.retry_backoff_seconds;
    state.status = "checking subscription...".to_string();
    spawn_request(state, "subscription check", now_s, move || {
        WorkerOutcome::FlagRead(with_retries(max_retries, backoff_s, || {
            request_flag(&endpoint, &user_id, &flag_key)
        }))
    });
}

fn kickoff_score_submit(state: &mut LeaderboardState, settings: &LeaderboardConfig, now_s: f64) {
    let Some(user_id) = state.user_id.clone() else {
        debug_assert!(false, "score submit without a signed-in user");
        state.phase = SessionPhase::Settled;
        return;
    };
    let Some(endpoint) = service_endpoint_from_env() else {
        state.phase = SessionPhase::Settled;
        return;
    };

    let score = state.pending_score;
    let max_retries = settings.api_max_retries;
    let backoff_s = settings.retry_backoff_seconds;
    state.status = "submitting score...".to_string();
    spawn_request(state, "score submit", now_s, move || {
        WorkerOutcome::ScoreSubmit(with_retries(max_retries, backoff_s, || {
            request_submit_score(&endpoint, &user_id, score)
        }))
    });
}

fn kickoff_subscribe(state: &mut LeaderboardState, settings: &LeaderboardConfig, now_s: f64) {
    let Some(user_id) = state.user_id.clone() else {
        state.phase = SessionPhase::Settled;
        return;
    };
    let Some(endpoint) = service_endpoint_from_env() else {
        state.phase = SessionPhase::Settled;
        return;
    };

    let flag_key = settings.subscription_flag_key.clone();
    let max_retries = settings.api_max_retries;
    let backoff_s = settings.retry_backoff_seconds;
    state.status = "subscribing...".to_string();
    spawn_request(state, "subscribe", now_s, move || {
        WorkerOutcome::FlagWrite(with_retries(max_retries, backoff_s, || {
            request_set_flag(&endpoint, &user_id, &flag_key, true)
        }))
    });
}

fn spawn_request(
    state: &mut LeaderboardState,
    label: &'static str,
    now_s: f64,
    job: impl FnOnce() -> WorkerOutcome + Send + 'static,
) {
    state.inflight = Some(InFlightRequest {
        label,
        started_at_s: now_s,
        handle: std::thread::spawn(job),
    });
}

pub(crate) fn access_from_flag(flag: Option<bool>) -> AccessGate {
    if flag == Some(true) {
        AccessGate::Granted
    } else {
        AccessGate::Denied
    }
}

#[derive(Debug, Clone)]
struct ServiceEndpoint {
    base_url: String,
    api_key: String,
}

fn service_endpoint_from_env() -> Option<ServiceEndpoint> {
    let api_key = std::env::var(API_KEY_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())?;
    let base_url =
        std::env::var(API_BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());

    Some(ServiceEndpoint { base_url, api_key })
}

fn credentials_from_env() -> Option<(String, String)> {
    let email = std::env::var(ACCOUNT_EMAIL_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())?;
    let password = std::env::var(ACCOUNT_PASSWORD_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())?;
    Some((email, password))
}

fn with_retries<T>(
    max_retries: u32,
    backoff_seconds: f32,
    mut op: impl FnMut() -> Result<T, String>,
) -> Result<T, String> {
    let total_attempts = max_retries.saturating_add(1).max(1);
    let mut delay_seconds = backoff_seconds.max(0.0) as f64;
    let mut last_error = String::new();

    for attempt_index in 0..total_attempts {
        match op() {
            Ok(result) => return Ok(result),
            Err(error_message) => {
                last_error = error_message;
                if attempt_index + 1 >= total_attempts {
                    break;
                }
                warn!(
                    "Leaderboard request attempt {}/{} failed: {}",
                    attempt_index + 1,
                    total_attempts,
                    truncate(&last_error, 180)
                );
                if delay_seconds > 0.0 {
                    std::thread::sleep(Duration::from_secs_f64(delay_seconds));
                    delay_seconds = (delay_seconds * 2.0).min(8.0);
                }
            }
        }
    }

    Err(format!(
        "all {} attempt(s) failed: {}",
        total_attempts,
        truncate(&last_error, 220)
    ))
}

fn request_sign_in(
    endpoint: &ServiceEndpoint,
    email: &str,
    password: &str,
) -> Result<String, String> {
    let url = format!(
        "{}/api/v1/auth/sign_in",
        endpoint.base_url.trim_end_matches('/')
    );
    let payload = serde_json::to_string(&SignInRequestPayload { email, password })
        .map_err(|e| format!("sign-in payload encode failed: {e}"))?;

    let (status, body) = run_curl_json_post(&url, &payload, &endpoint.api_key)?;
    if !(200..300).contains(&status) {
        return Err(format!("sign-in http {status}: {}", truncate(&body, 220)));
    }

    parse_sign_in_response(&body)
}

fn parse_sign_in_response(body: &str) -> Result<String, String> {
    let parsed: SignInResponsePayload = serde_json::from_str(body).map_err(|e| {
        format!(
            "sign-in response decode failed: {e}; body={}",
            truncate(body, 220)
        )
    })?;
    if parsed.user_id.trim().is_empty() {
        return Err("sign-in returned an empty user id".to_string());
    }
    Ok(parsed.user_id)
}

fn request_flag(
    endpoint: &ServiceEndpoint,
    user_id: &str,
    flag_key: &str,
) -> Result<Option<bool>, String> {
    let url = format!(
        "{}/api/v1/users/{}/flags/{}",
        endpoint.base_url.trim_end_matches('/'),
        user_id,
        flag_key
    );

    let (status, body) = run_curl_json_get(&url, &endpoint.api_key)?;
    if status == 404 {
        // The flag was never written for this user.
        return Ok(None);
    }
    if !(200..300).contains(&status) {
        return Err(format!("flag read http {status}: {}", truncate(&body, 220)));
    }

    parse_flag_response(&body)
}

fn parse_flag_response(body: &str) -> Result<Option<bool>, String> {
    let parsed: FlagResponsePayload = serde_json::from_str(body).map_err(|e| {
        format!(
            "flag response decode failed: {e}; body={}",
            truncate(body, 220)
        )
    })?;
    Ok(parsed.value)
}

fn request_set_flag(
    endpoint: &ServiceEndpoint,
    user_id: &str,
    flag_key: &str,
    value: bool,
) -> Result<(), String> {
    let url = format!(
        "{}/api/v1/users/{}/flags",
        endpoint.base_url.trim_end_matches('/'),
        user_id
    );
    let payload = serde_json::to_string(&FlagWriteRequestPayload {
        key: flag_key,
        value,
    })
    .map_err(|e| format!("flag payload encode failed: {e}"))?;

    let (status, body) = run_curl_json_post(&url, &payload, &endpoint.api_key)?;
    if !(200..300).contains(&status) {
        return Err(format!(
            "flag write http {status}: {}",
            truncate(&body, 220)
        ));
    }
    Ok(())
}

fn request_submit_score(
    endpoint: &ServiceEndpoint,
    user_id: &str,
    score: u32,
) -> Result<(), String> {
    let url = format!(
        "{}/api/v1/users/{}/scores",
        endpoint.base_url.trim_end_matches('/'),
        user_id
    );
    let payload = serde_json::to_string(&ScoreSubmitRequestPayload { score })
        .map_err(|e| format!("score payload encode failed: {e}"))?;

    let (status, body) = run_curl_json_post(&url, &payload, &endpoint.api_key)?;
    if !(200..300).contains(&status) {
        return Err(format!(
            "score submit http {status}: {}",
            truncate(&body, 220)
        ));
    }
    Ok(())
}

fn run_curl_json_post(
    url: &str,
    payload_json: &str,
    api_key: &str,
) -> Result<(u16, String), String> {
    let status_marker = "__HTTP_STATUS__:";
    let args = vec![
        "-sS".to_string(),
        "-L".to_string(),
        "--connect-timeout".to_string(),
        CURL_CONNECT_TIMEOUT_SECONDS.to_string(),
        "--max-time".to_string(),
        CURL_REQUEST_TIMEOUT_SECONDS.to_string(),
        "-X".to_string(),
        "POST".to_string(),
        url.to_string(),
        "-H".to_string(),
        "Content-Type: application/json".to_string(),
        "-H".to_string(),
        format!("x-api-key: {api_key}"),
        "--data-raw".to_string(),
        payload_json.to_string(),
        "-w".to_string(),
        format!("\\n{status_marker}%{{http_code}}"),
    ];

    run_curl_with_status_marker(&args, status_marker)
}

fn run_curl_json_get(url: &str, api_key: &str) -> Result<(u16, String), String> {
    let status_marker = "__HTTP_STATUS__:";
    let args = vec![
        "-sS".to_string(),
        "-L".to_string(),
        "--connect-timeout".to_string(),
        CURL_CONNECT_TIMEOUT_SECONDS.to_string(),
        "--max-time".to_string(),
        CURL_REQUEST_TIMEOUT_SECONDS.to_string(),
        url.to_string(),
        "-H".to_string(),
        "Accept: application/json".to_string(),
        "-H".to_string(),
        format!("x-api-key: {api_key}"),
        "-w".to_string(),
        format!("\\n{status_marker}%{{http_code}}"),
    ];

    run_curl_with_status_marker(&args, status_marker)
}

fn run_curl_with_status_marker(
    args: &[String],
    status_marker: &str,
) -> Result<(u16, String), String> {
    let output = run_curl_capture_stdout(args)?;
    let marker_index = output
        .rfind(status_marker)
        .ok_or_else(|| "missing HTTP status marker in curl output".to_string())?;
    let (body, status_suffix) = output.split_at(marker_index);
    let status_code = status_suffix[status_marker.len()..]
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("failed to parse curl status code: {e}"))?;
    Ok((status_code, body.trim().to_string()))
}

fn run_curl_capture_stdout(args: &[String]) -> Result<String, String> {
    let run = |binary: &str| Command::new(binary).args(args).output();
    let output = match run("curl") {
        Ok(output) => output,
        Err(error) => return Err(format!("failed to execute curl: {error}")),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(format!("curl command failed: {}", truncate(&stderr, 240)));
    }

    String::from_utf8(output.stdout)
        .map_err(|error| format!("curl output was not valid UTF-8: {error}"))
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut truncated = String::new();
    for (index, c) in input.chars().enumerate() {
        if index >= max_chars.saturating_sub(1) {
            break;
        }
        truncated.push(c);
    }
    truncated.push_str("...");
    truncated
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequestPayload<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponsePayload {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct FlagResponsePayload {
    value: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagWriteRequestPayload<'a> {
    key: &'a str,
    value: bool,
}

#[derive(Debug, Serialize)]
struct ScoreSubmitRequestPayload {
    score: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_in_response_parses_the_user_id() {
        let user_id = parse_sign_in_response(r#"{"userId": "user-a17"}"#).expect("should parse");
        assert_eq!(user_id, "user-a17");
    }

    #[test]
    fn sign_in_response_rejects_blank_or_malformed_ids() {
        assert!(parse_sign_in_response(r#"{"userId": "  "}"#).is_err());
        assert!(parse_sign_in_response(r#"{"wrong": "field"}"#).is_err());
        assert!(parse_sign_in_response("not json").is_err());
    }

    #[test]
    fn flag_response_carries_all_three_states() {
        assert_eq!(parse_flag_response(r#"{"value": true}"#), Ok(Some(true)));
        assert_eq!(parse_flag_response(r#"{"value": false}"#), Ok(Some(false)));
        assert_eq!(parse_flag_response(r#"{"value": null}"#), Ok(None));
    }

    #[test]
    fn only_an_explicit_true_flag_grants_access() {
        assert_eq!(access_from_flag(Some(true)), AccessGate::Granted);
        assert_eq!(access_from_flag(Some(false)), AccessGate::Denied);
        assert_eq!(access_from_flag(None), AccessGate::Denied);
    }

    #[test]
    fn truncate_preserves_short_input_and_caps_long_input() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(50);
        let capped = truncate(&long, 10);
        assert!(capped.ends_with("..."));
        assert!(capped.chars().count() <= 13);
    }
}
