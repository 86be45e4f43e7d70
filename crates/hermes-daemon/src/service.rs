/// StationService: the backend that knows what a station plays next.
///
/// The engine only sees the trait.  `HttpStationService` is the default
/// adapter: a small JSON-over-HTTP client.
///
///   GET  {base}/stations/{id}/playlist   → [Song]
///   POST {base}/songs/{id}/feedback      {"station_id", "liked"}
///   POST {base}/songs/{id}/tired         {"station_id"}
///   GET  <art url>                       → image bytes
///
/// 401/403 map to `AuthExpired`; every other failure is a `NetworkError`.
use std::time::Duration;

use async_trait::async_trait;
use hermes_proto::config::ServiceConfig;
use hermes_proto::error::QueueError;
use hermes_proto::protocol::{Song, Station};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

#[async_trait]
pub trait StationService: Send + Sync {
    /// Next batch of songs for `station`.  An empty batch is not an error
    /// here; the engine decides what it means.
    async fn fetch_batch(&self, station: &Station) -> Result<Vec<Song>, QueueError>;

    async fn submit_rating(
        &self,
        station: &Station,
        song: &Song,
        liked: bool,
    ) -> Result<(), QueueError>;

    /// "Don't play this for a while."
    async fn submit_tired(&self, station: &Station, song: &Song) -> Result<(), QueueError>;

    async fn fetch_art(&self, url: &str) -> Result<Vec<u8>, QueueError>;
}

// ── HTTP adapter ──────────────────────────────────────────────────────────────

pub struct HttpStationService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct FeedbackBody<'a> {
    station_id: &'a str,
    liked: bool,
}

#[derive(Serialize)]
struct TiredBody<'a> {
    station_id: &'a str,
}

impl HttpStationService {
    pub fn new(config: &ServiceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hermes-daemon/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn authorise(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, QueueError> {
        let response = self
            .authorise(req)
            .send()
            .await
            .map_err(|e| QueueError::NetworkError(e.to_string()))?;
        check_status(response.status())?;
        Ok(response)
    }
}

fn check_status(status: StatusCode) -> Result<(), QueueError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(QueueError::AuthExpired);
    }
    if !status.is_success() {
        return Err(QueueError::NetworkError(format!("HTTP {}", status)));
    }
    Ok(())
}

#[async_trait]
impl StationService for HttpStationService {
    async fn fetch_batch(&self, station: &Station) -> Result<Vec<Song>, QueueError> {
        let url = format!("{}/stations/{}/playlist", self.base_url, station.id);
        debug!("service: GET {}", url);
        let response = self.send(self.client.get(&url)).await?;
        response
            .json::<Vec<Song>>()
            .await
            .map_err(|e| QueueError::NetworkError(format!("bad playlist body: {}", e)))
    }

    async fn submit_rating(
        &self,
        station: &Station,
        song: &Song,
        liked: bool,
    ) -> Result<(), QueueError> {
        let url = format!("{}/songs/{}/feedback", self.base_url, song.id);
        debug!("service: POST {} liked={}", url, liked);
        let body = FeedbackBody {
            station_id: &station.id,
            liked,
        };
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn submit_tired(&self, station: &Station, song: &Song) -> Result<(), QueueError> {
        let url = format!("{}/songs/{}/tired", self.base_url, song.id);
        debug!("service: POST {}", url);
        let body = TiredBody {
            station_id: &station.id,
        };
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn fetch_art(&self, url: &str) -> Result<Vec<u8>, QueueError> {
        let response = self.send(self.client.get(url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| QueueError::NetworkError(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_for(server: &mockito::ServerGuard) -> HttpStationService {
        let config = ServiceConfig {
            base_url: format!("{}/v1/", server.url()),
            token: Some("secret".into()),
            request_timeout_secs: 5,
        };
        HttpStationService::new(&config).unwrap()
    }

    fn station() -> Station {
        Station {
            id: "st-9".into(),
            name: "Dub Techno".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_batch_parses_songs() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/stations/st-9/playlist")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"id":"s1","title":"Aqua","artist":"Deepchord","stream_url":"http://a/s1.mp3"},
                    {"id":"s2","title":"Vantage","artist":"Vainqueur","stream_url":"http://a/s2.mp3","rating":"Liked"}]"#,
            )
            .create_async()
            .await;

        let songs = service_for(&server).fetch_batch(&station()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[0].artist, "Deepchord");
        assert_eq!(songs[0].duration_secs, None);
        assert_eq!(songs[1].rating, hermes_proto::protocol::Rating::Liked);
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_auth_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/stations/st-9/playlist")
            .with_status(403)
            .create_async()
            .await;

        let err = service_for(&server)
            .fetch_batch(&station())
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::AuthExpired);
    }

    #[tokio::test]
    async fn test_server_error_is_network_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/songs/s1/feedback")
            .with_status(503)
            .create_async()
            .await;

        let song = Song {
            id: "s1".into(),
            ..Default::default()
        };
        let err = service_for(&server)
            .submit_rating(&station(), &song, true)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NetworkError(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_feedback_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/songs/s1/feedback")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "station_id": "st-9",
                "liked": false
            })))
            .with_status(204)
            .create_async()
            .await;

        let song = Song {
            id: "s1".into(),
            ..Default::default()
        };
        service_for(&server)
            .submit_rating(&station(), &song, false)
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
