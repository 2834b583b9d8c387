//! Volumetric lookup client.
//!
//! Maps a 3-D point to the supervoxel id of the segmentation voxel it lands
//! in. Point coordinates are stored at the annotation table's voxel
//! resolution; the service is told that resolution so it can rescale.

use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::Error;

#[derive(Debug, Serialize)]
struct PointLookupRequest {
    point: [f64; 3],
    size: u32,
    coord_resolution: [f64; 3],
}

#[derive(Debug, Deserialize)]
struct PointLookupResponse {
    supervoxel_id: i64,
}

/// Client for one segmentation volume.
#[derive(Debug, Clone)]
pub struct VolumeClient {
    http: reqwest::Client,
    base_url: Url,
    /// Source identifier of the segmentation volume.
    source: String,
}

impl VolumeClient {
    pub fn new(base_url: Url, source: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Looks up the supervoxel id under a single point.
    ///
    /// A point over unsegmented space resolves to supervoxel id `0`.
    #[instrument(skip(self), fields(source = %self.source), err)]
    pub async fn download_point(
        &self,
        point: [f64; 3],
        coord_resolution: [f64; 3],
    ) -> Result<i64, Error> {
        let mut url = self
            .base_url
            .join("lookup/point")
            .map_err(|err| Error::InvalidEndpoint(err.to_string()))?;
        url.query_pairs_mut().append_pair("source", &self.source);

        let request = PointLookupRequest {
            point,
            size: 1,
            coord_resolution,
        };
        let response: PointLookupResponse = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.supervoxel_id)
    }
}
