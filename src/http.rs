use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{ClientError, Result};
use crate::model::{LoadResult, Track, TrackHandle, TrackInfo};

/// REST side of a node: track lookups and decoding.
pub struct Http {
    client: reqwest::Client,
    pub base_url: Url,
}

/// `/decodetrack` answers with a full track on newer nodes and with bare info on older ones.
#[derive(Deserialize)]
#[serde(untagged)]
enum Decoded {
    Full(Track),
    Info(TrackInfo),
}

impl Http {
    pub fn new(password: &str, base_url: Url) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(password)
            .map_err(|e| ClientError::Config(format!("password: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: reqwest::Client::builder().default_headers(headers).build()?,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path, e)))
    }

    /// `GET /loadtracks?identifier=`. Search prefixes (`ytsearch:` etc.) are passed through.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let mut url = self.endpoint("loadtracks")?;
        url.query_pairs_mut().append_pair("identifier", identifier);
        let response = self.client.get(url).send().await?;
        read(response).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<TrackHandle> {
        let mut url = self.endpoint("decodetrack")?;
        url.query_pairs_mut().append_pair("encodedTrack", encoded);
        let response = self.client.get(url).send().await?;

        Ok(match read::<Decoded>(response).await? {
            Decoded::Full(track) => track.into(),
            Decoded::Info(info) => Track {
                encoded: encoded.to_string(),
                info,
            }
            .into(),
        })
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackHandle>> {
        let url = self.endpoint("decodetracks")?;
        let response = self.client.post(url).json(encoded).send().await?;
        read(response).await
    }
}

async fn read<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ClientError::Api(format!("HTTP {}: {}", status.as_u16(), body)));
    }
    Ok(serde_json::from_str(&body)?)
}
