use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

pub const MISSING_KEY_DESCRIPTION: &str = "weather data unavailable";
pub const API_ERROR_DESCRIPTION: &str = "data unavailable (API error)";
/// Mist.
pub const FALLBACK_ICON: &str = "50d";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub name: &'static str,
    pub lat: f64,
    pub lon: f64,
}

pub const PRESET_LOCATIONS: [Location; 6] = [
    Location {
        name: "Bengaluru",
        lat: 12.9716,
        lon: 77.5946,
    },
    Location {
        name: "New York",
        lat: 40.7128,
        lon: -74.006,
    },
    Location {
        name: "London",
        lat: 51.5074,
        lon: -0.1278,
    },
    Location {
        name: "Tokyo",
        lat: 35.6762,
        lon: 139.6503,
    },
    Location {
        name: "Sydney",
        lat: -33.8688,
        lon: 151.2093,
    },
    Location {
        name: "Rio de Janeiro",
        lat: -22.9068,
        lon: -43.1729,
    },
];

pub fn find_location(name: &str) -> Option<&'static Location> {
    let wanted = name.trim();
    PRESET_LOCATIONS
        .iter()
        .find(|location| location.name.eq_ignore_ascii_case(wanted))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherSource {
    Live,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    /// Degrees Celsius.
    pub temperature: f64,
    pub description: String,
    /// Percent.
    pub humidity: u8,
    /// Metres per second.
    pub wind_speed: f64,
    pub icon: String,
    pub source: WeatherSource,
}

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather API key is missing")]
    MissingApiKey,
    #[error("invalid weather endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("weather request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("weather API error: {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid weather data received from API: {0}")]
    Malformed(String),
}

/// Plausible made-up conditions used whenever live data is unavailable.
pub fn fallback_report(description: &str, rng: &mut impl Rng) -> WeatherReport {
    WeatherReport {
        temperature: rng.gen_range(20.0..30.0),
        description: description.to_owned(),
        humidity: rng.gen_range(60..80),
        wind_speed: rng.gen_range(2.0..5.0),
        icon: FALLBACK_ICON.to_owned(),
        source: WeatherSource::Fallback,
    }
}

pub fn parse_report(body: &Value) -> Result<WeatherReport, WeatherError> {
    let main = body
        .get("main")
        .ok_or_else(|| WeatherError::Malformed("missing 'main'".to_owned()))?;
    let current = body
        .get("weather")
        .and_then(|weather| weather.get(0))
        .ok_or_else(|| WeatherError::Malformed("missing 'weather[0]'".to_owned()))?;

    let temperature = main
        .get("temp")
        .and_then(Value::as_f64)
        .ok_or_else(|| WeatherError::Malformed("missing 'main.temp'".to_owned()))?;
    let humidity = main
        .get("humidity")
        .and_then(Value::as_f64)
        .map(|h| h.clamp(0.0, 100.0).round() as u8)
        .ok_or_else(|| WeatherError::Malformed("missing 'main.humidity'".to_owned()))?;
    let wind_speed = body
        .get("wind")
        .and_then(|wind| wind.get("speed"))
        .and_then(Value::as_f64)
        .ok_or_else(|| WeatherError::Malformed("missing 'wind.speed'".to_owned()))?;

    Ok(WeatherReport {
        temperature,
        description: current
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        humidity,
        wind_speed,
        icon: current
            .get("icon")
            .and_then(Value::as_str)
            .unwrap_or(FALLBACK_ICON)
            .to_owned(),
        source: WeatherSource::Live,
    })
}

#[derive(Debug, Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl WeatherClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Current conditions at `lat`/`lon`. Never fails: a missing key or any
    /// API problem yields fallback data with an explanatory description.
    pub async fn fetch(&self, lat: f64, lon: f64) -> WeatherReport {
        match self.try_fetch(lat, lon).await {
            Ok(report) => report,
            Err(WeatherError::MissingApiKey) => {
                error!("weather API key is missing, using fallback data");
                fallback_report(MISSING_KEY_DESCRIPTION, &mut rand::thread_rng())
            }
            Err(err) => {
                error!("error fetching weather data: {err}");
                fallback_report(API_ERROR_DESCRIPTION, &mut rand::thread_rng())
            }
        }
    }

    pub async fn try_fetch(&self, lat: f64, lon: f64) -> Result<WeatherReport, WeatherError> {
        let key = self.api_key.as_deref().ok_or(WeatherError::MissingApiKey)?;
        let url = Url::parse_with_params(
            &self.endpoint,
            &[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("units", "metric".to_owned()),
                ("appid", key.to_owned()),
            ],
        )?;

        info!(lat, lon, "fetching weather data");
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %body, "weather API rejected request");
            return Err(WeatherError::Status(status));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|err| WeatherError::Malformed(err.to_string()))?;
        parse_report(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        API_ERROR_DESCRIPTION, FALLBACK_ICON, MISSING_KEY_DESCRIPTION, WeatherClient,
        WeatherError, WeatherSource, fallback_report, find_location, parse_report,
    };
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/data/2.5/weather")
    }

    #[tokio::test]
    async fn missing_key_returns_fallback_in_range() {
        let client = WeatherClient::new("http://127.0.0.1:9/unused", None);
        for _ in 0..50 {
            let report = client.fetch(12.9716, 77.5946).await;
            assert!((20.0..=30.0).contains(&report.temperature));
            assert!((60..=80).contains(&report.humidity));
            assert!((2.0..=5.0).contains(&report.wind_speed));
            assert_eq!(report.description, MISSING_KEY_DESCRIPTION);
            assert_eq!(report.icon, FALLBACK_ICON);
            assert_eq!(report.source, WeatherSource::Fallback);
        }
    }

    #[test]
    fn blank_key_counts_as_missing() {
        assert!(!WeatherClient::new("http://x", Some("  ".to_owned())).has_api_key());
    }

    #[tokio::test]
    async fn api_errors_fall_back_with_error_description() {
        let endpoint = serve_once("401 Unauthorized", r#"{"cod":401}"#).await;
        let client = WeatherClient::new(endpoint, Some("bad-key".to_owned()));
        let report = client.fetch(51.5074, -0.1278).await;
        assert_eq!(report.description, API_ERROR_DESCRIPTION);
        assert_eq!(report.source, WeatherSource::Fallback);
    }

    #[tokio::test]
    async fn live_response_is_parsed() {
        let endpoint = serve_once(
            "200 OK",
            r#"{"main":{"temp":18.4,"humidity":72},"weather":[{"description":"light rain","icon":"10d"}],"wind":{"speed":4.1}}"#,
        )
        .await;
        let client = WeatherClient::new(endpoint, Some("key".to_owned()));
        let report = client.try_fetch(35.6762, 139.6503).await.unwrap();
        assert_eq!(report.description, "light rain");
        assert_eq!(report.icon, "10d");
        assert_eq!(report.humidity, 72);
        assert!((report.temperature - 18.4).abs() < f64::EPSILON);
        assert_eq!(report.source, WeatherSource::Live);
    }

    #[test]
    fn incomplete_bodies_are_malformed() {
        let err = parse_report(&json!({"main": {"temp": 20.0}})).unwrap_err();
        assert!(matches!(err, WeatherError::Malformed(_)));
    }

    #[test]
    fn fallback_values_stay_in_range_for_any_seed() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let report = fallback_report(API_ERROR_DESCRIPTION, &mut rng);
            assert!((20.0..30.0).contains(&report.temperature));
            assert!((60..80).contains(&report.humidity));
            assert!((2.0..5.0).contains(&report.wind_speed));
        }
    }

    #[test]
    fn preset_locations_resolve_by_name() {
        let rio = find_location("rio de janeiro").unwrap();
        assert!((rio.lat + 22.9068).abs() < 1e-9);
        assert!(find_location("Atlantis").is_none());
    }
}
