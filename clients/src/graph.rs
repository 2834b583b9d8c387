//! Graph-service client.
//!
//! The graph service resolves supervoxel ids to root ids as of a timestamp.
//! It is treated as a stateless, retryable RPC peer: the only guarantee is
//! that an answer is correct for the timestamp it was asked about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::Error;

#[derive(Debug, Serialize)]
struct RootsRequest<'a> {
    node_ids: &'a [i64],
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RootsResponse {
    root_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct DeltaRootsResponse {
    old_roots: Vec<i64>,
    new_roots: Vec<i64>,
}

/// Client for one graph-service table.
#[derive(Debug, Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: Url,
    table: String,
}

impl GraphClient {
    pub fn new(base_url: Url, table: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(&format!("table/{}/{path}", self.table))
            .map_err(|err| Error::InvalidEndpoint(err.to_string()))
    }

    /// Resolves a batch of supervoxel ids to root ids as of `timestamp`.
    ///
    /// The response preserves input order; a supervoxel unknown to the graph
    /// resolves to root id `0`.
    #[instrument(skip(self, supervoxel_ids), fields(table = %self.table, batch = supervoxel_ids.len()), err)]
    pub async fn get_roots(
        &self,
        supervoxel_ids: &[i64],
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<i64>, Error> {
        if supervoxel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint("roots")?;
        let request = RootsRequest {
            node_ids: supervoxel_ids,
            timestamp: timestamp.timestamp(),
        };
        let response: RootsResponse = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.root_ids.len() != supervoxel_ids.len() {
            return Err(Error::BatchSizeMismatch {
                sent: supervoxel_ids.len(),
                received: response.root_ids.len(),
            });
        }
        Ok(response.root_ids)
    }

    /// Root ids invalidated by proofreading between two timestamps, paired
    /// with their replacements.
    ///
    /// Used by the expired-roots sweep; callers treat this as
    /// fire-and-forget.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn get_proofread_root_ids(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(Vec<i64>, Vec<i64>), Error> {
        let mut url = self.endpoint("delta_roots")?;
        url.query_pairs_mut()
            .append_pair("since", &since.timestamp().to_string())
            .append_pair("until", &until.timestamp().to_string());
        let response: DeltaRootsResponse = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok((response.old_roots, response.new_roots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_table_segment() {
        let client = GraphClient::new(
            "https://graph.example.com/segmentation/api/v1/".parse().unwrap(),
            "minnie3_v1",
        );

        let url = client.endpoint("roots").unwrap();

        assert_eq!(
            url.as_str(),
            "https://graph.example.com/segmentation/api/v1/table/minnie3_v1/roots"
        );
    }
}
