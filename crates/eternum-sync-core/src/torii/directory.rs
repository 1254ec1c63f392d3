//! Structure directory - who owns which structure, and where it is.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// A structure and its map position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructureLocation {
    pub entity_id: u32,
    pub owner: String,
    pub coord_x: u32,
    pub coord_y: u32,
}

impl StructureLocation {
    pub fn position(&self) -> (u32, u32) {
        (self.coord_x, self.coord_y)
    }
}

/// Authoritative structure ownership lookups.
#[async_trait]
pub trait StructureDirectory: Send + Sync {
    async fn fetch_structures_by_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<StructureLocation>, IndexerError>;

    async fn fetch_first_structure(&self) -> Result<Option<StructureLocation>, IndexerError>;
}

/// Normalise an address to `0x` + 64 lowercase hex digits.
///
/// Anything that is not a felt-sized hex string is rejected, so the result is
/// safe to splice into SQL text.
pub fn format_address_for_query(address: &str) -> Result<String, IndexerError> {
    let trimmed = address.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IndexerError::Decode(format!("invalid address {address:?}")));
    }
    Ok(format!("0x{:0>64}", digits.to_ascii_lowercase()))
}

/// Directory backed by the indexer's SQL endpoint.
pub struct SqlDirectory {
    client: reqwest::Client,
    base_url: String,
    structure_table: String,
}

impl SqlDirectory {
    pub fn new(base_url: &str, namespace: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            structure_table: format!("{namespace}-Structure"),
        }
    }

    fn structures_by_owner_query(&self, owner: &str) -> Result<String, IndexerError> {
        Ok(format!(
            "SELECT `base.coord_x` AS coord_x, `base.coord_y` AS coord_y, entity_id, owner \
             FROM [{}] WHERE owner == '{}';",
            self.structure_table,
            format_address_for_query(owner)?
        ))
    }

    fn first_structure_query(&self) -> String {
        format!(
            "SELECT entity_id, owner, `base.coord_x` AS coord_x, `base.coord_y` AS coord_y \
             FROM `{}` LIMIT 1;",
            self.structure_table
        )
    }

    async fn run<T: for<'de> Deserialize<'de>>(&self, sql: &str) -> Result<Vec<T>, IndexerError> {
        tracing::debug!(sql, "Running directory query");

        let response = self
            .client
            .get(format!("{}/sql", self.base_url))
            .query(&[("query", sql)])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| IndexerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl StructureDirectory for SqlDirectory {
    async fn fetch_structures_by_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<StructureLocation>, IndexerError> {
        self.run(&self.structures_by_owner_query(owner)?).await
    }

    async fn fetch_first_structure(&self) -> Result<Option<StructureLocation>, IndexerError> {
        let rows: Vec<StructureLocation> = self.run(&self.first_structure_query()).await?;
        Ok(rows.into_iter().next())
    }
}

/// Fixed in-memory directory.
#[derive(Default)]
pub struct StaticDirectory {
    structures: RwLock<Vec<StructureLocation>>,
}

impl StaticDirectory {
    pub fn new(structures: Vec<StructureLocation>) -> Self {
        Self {
            structures: RwLock::new(structures),
        }
    }

    pub fn set_structures(&self, structures: Vec<StructureLocation>) {
        *self.structures.write() = structures;
    }

    pub fn push(&self, structure: StructureLocation) {
        self.structures.write().push(structure);
    }
}

#[async_trait]
impl StructureDirectory for StaticDirectory {
    async fn fetch_structures_by_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<StructureLocation>, IndexerError> {
        let owner = format_address_for_query(owner)?;
        Ok(self
            .structures
            .read()
            .iter()
            .filter(|s| format_address_for_query(&s.owner).is_ok_and(|a| a == owner))
            .cloned()
            .collect())
    }

    async fn fetch_first_structure(&self) -> Result<Option<StructureLocation>, IndexerError> {
        Ok(self.structures.read().first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_padded_and_lowercased() {
        assert_eq!(
            format_address_for_query("0xABC").unwrap(),
            format!("0x{}abc", "0".repeat(61))
        );
        assert_eq!(format_address_for_query("0xabc").unwrap().len(), 66);
    }

    #[test]
    fn non_hex_addresses_are_rejected() {
        assert!(matches!(
            format_address_for_query("0x1' OR owner != '"),
            Err(IndexerError::Decode(_))
        ));
        assert!(format_address_for_query("0x").is_err());
        assert!(format_address_for_query(&format!("0x{}", "f".repeat(65))).is_err());

        let directory = SqlDirectory::new("http://localhost:8080", "s1_eternum");
        assert!(directory.structures_by_owner_query("0x1;DROP").is_err());
    }

    #[test]
    fn owner_query_targets_namespaced_table() {
        let directory = SqlDirectory::new("http://localhost:8080/", "s1_eternum");
        let sql = directory.structures_by_owner_query("0x1").unwrap();
        assert!(sql.contains("[s1_eternum-Structure]"));
        assert!(sql.contains(&format_address_for_query("0x1").unwrap()));
        assert_eq!(directory.base_url, "http://localhost:8080");
    }

    #[test]
    fn sql_rows_decode() {
        let rows: Vec<StructureLocation> = serde_json::from_str(
            r#"[{"coord_x": 10, "coord_y": 20, "entity_id": 7, "owner": "0x1"}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].position(), (10, 20));
    }

    #[tokio::test]
    async fn static_directory_matches_owner_regardless_of_padding() {
        let directory = StaticDirectory::new(vec![StructureLocation {
            entity_id: 1,
            owner: "0x00abc".into(),
            coord_x: 1,
            coord_y: 1,
        }]);
        let owned = directory.fetch_structures_by_owner("0xABC").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!(directory.fetch_structures_by_owner("0x1").await.unwrap().is_empty());
    }
}
