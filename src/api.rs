use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use url::Url;

pub const APPLICATION_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const ANALYSIS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed-interval polling while the analysis is pending.
pub const ANALYSIS_POLL_DELAY: Duration = Duration::from_secs(2);
/// Pending responses tolerated before the poll is declared terminal.
pub const ANALYSIS_POLL_MAX_ATTEMPTS: u32 = 60;

pub const ANALYSIS_PENDING_MESSAGE: &str = "Analysis pending";
pub const ANALYSIS_STILL_PROCESSING_MESSAGE: &str = "Analysis is still processing";

/// Typed upstream failure: a human-readable message plus the HTTP status it
/// came from, so callers can branch without parsing message text. Status `0`
/// marks local failures (bad input, network error, timeout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == 202
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status {})", self.message, self.status)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationResult {
    pub application_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// 0–100, displayed as a percentage.
    pub fit_score: f64,
    pub skills: Vec<String>,
    /// True when analysis could not be completed after retries.
    pub failed: bool,
}

/// Pull the user-facing message out of an error body's `detail` field:
/// either a string, or a non-empty array whose first element is a string or
/// an object with a `msg` field.
fn parse_detail(body: &Value) -> Option<String> {
    match body.get("detail") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => match items.first() {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(obj)) => obj.get("msg").map(|m| match m {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        },
        _ => None,
    }
}

fn generic_message(status: u16) -> &'static str {
    if status == 404 {
        return "Not found";
    }
    if status >= 500 {
        return "Service unavailable";
    }
    if status == 400 {
        return "Bad request";
    }
    if status == 422 {
        return "Invalid data";
    }
    "Request failed"
}

fn error_from_body(status: u16, body: Option<&Value>) -> ApiError {
    let message = body
        .and_then(parse_detail)
        .unwrap_or_else(|| generic_message(status).to_string());
    ApiError::new(status, message)
}

/// Interpret the application-creation response. `text` is the raw body.
fn decode_create_response(status: u16, text: &str) -> Result<ApplicationResult, ApiError> {
    let ok = (200..300).contains(&status);
    let body: Option<Value> = if text.is_empty() {
        None
    } else {
        match serde_json::from_str(text) {
            Ok(v) => Some(v),
            // Non-JSON body: fall back to the status-class message.
            Err(_) => return Err(ApiError::new(status, generic_message(status))),
        }
    };

    if ok {
        let id = body
            .as_ref()
            .and_then(|b| b.get("application_id"))
            .and_then(|v| v.as_str());
        return match id {
            Some(id) => Ok(ApplicationResult {
                application_id: id.to_string(),
            }),
            None => Err(ApiError::new(status, "Invalid response")),
        };
    }
    Err(error_from_body(status, body.as_ref()))
}

/// Interpret the analysis response. 202 maps to a pending error the polling
/// loop recognizes.
fn decode_analysis_response(status: u16, text: &str) -> Result<AnalysisResult, ApiError> {
    let body: Option<Value> = if text.is_empty() {
        None
    } else {
        match serde_json::from_str(text) {
            Ok(v) => Some(v),
            Err(_) => return Err(ApiError::new(status, generic_message(status))),
        }
    };

    if status == 200 {
        let fit_score = body
            .as_ref()
            .and_then(|b| b.get("fit_score"))
            .and_then(|v| v.as_f64());
        let skills = body.as_ref().and_then(|b| b.get("skills")).and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
        });
        return match (fit_score, skills) {
            (Some(fit_score), Some(skills)) => Ok(AnalysisResult {
                fit_score,
                skills,
                failed: body
                    .as_ref()
                    .and_then(|b| b.get("failed"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }),
            _ => Err(ApiError::new(status, "Invalid response")),
        };
    }
    if status == 202 {
        return Err(ApiError::new(202, ANALYSIS_PENDING_MESSAGE));
    }
    Err(error_from_body(status, body.as_ref()))
}

fn api_url(base_url: &str, segments: &[&str]) -> Result<Url, ApiError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let mut url = Url::parse(trimmed)
        .map_err(|e| ApiError::new(0, format!("invalid base url '{}': {}", trimmed, e)))?;
    {
        let mut parts = url
            .path_segments_mut()
            .map_err(|_| ApiError::new(0, format!("invalid base url '{}'", trimmed)))?;
        parts.clear();
        parts.extend(segments);
    }
    Ok(url)
}

/// POST /api/applications. Validates inputs before any network access.
pub async fn create_application(
    base_url: &str,
    username: &str,
    job_offer_id: &str,
) -> Result<ApplicationResult, ApiError> {
    let username = username.trim();
    let job_offer_id = job_offer_id.trim();
    if username.is_empty() || job_offer_id.is_empty() {
        return Err(ApiError::new(0, "Username and job offer are required"));
    }

    let url = api_url(base_url, &["api", "applications"])?;
    let client = reqwest::Client::builder()
        .timeout(APPLICATION_CREATE_TIMEOUT)
        .build()
        .map_err(|e| ApiError::new(0, format!("http client error: {}", e)))?;

    let response = client
        .post(url)
        .json(&serde_json::json!({
            "username": username,
            "job_offer_id": job_offer_id,
        }))
        .send()
        .await
        .map_err(|_| ApiError::new(0, "Service unavailable"))?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|_| ApiError::new(0, "Service unavailable"))?;
    decode_create_response(status, &text)
}

/// GET /api/applications/{id}/analysis. A 202 comes back as a pending
/// `ApiError`; see [`poll_analysis`].
pub async fn get_analysis(base_url: &str, application_id: &str) -> Result<AnalysisResult, ApiError> {
    let id = application_id.trim();
    if id.is_empty() {
        return Err(ApiError::new(0, "application_id is required"));
    }

    let url = api_url(base_url, &["api", "applications", id, "analysis"])?;
    let client = reqwest::Client::builder()
        .timeout(ANALYSIS_FETCH_TIMEOUT)
        .build()
        .map_err(|e| ApiError::new(0, format!("http client error: {}", e)))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|_| ApiError::new(0, "Service unavailable"))?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|_| ApiError::new(0, "Service unavailable"))?;
    decode_analysis_response(status, &text)
}

/// Re-issue `fetch` at a fixed interval while it reports pending. Anything
/// else (success or a non-pending error) is terminal and returned as-is.
/// The attempt budget bounds the loop; exhausting it surfaces a terminal
/// still-processing failure.
pub async fn poll_analysis<F, Fut>(
    mut fetch: F,
    delay: Duration,
    max_attempts: u32,
) -> Result<AnalysisResult, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<AnalysisResult, ApiError>>,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match fetch().await {
            Err(e) if e.is_pending() => {
                if attempt == max_attempts {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
    Err(ApiError::new(202, ANALYSIS_STILL_PROCESSING_MESSAGE))
}

/// Poll the analysis endpoint with the default delay and attempt budget.
pub async fn wait_for_analysis(
    base_url: &str,
    application_id: &str,
) -> Result<AnalysisResult, ApiError> {
    poll_analysis(
        || get_analysis(base_url, application_id),
        ANALYSIS_POLL_DELAY,
        ANALYSIS_POLL_MAX_ATTEMPTS,
    )
    .await
}
