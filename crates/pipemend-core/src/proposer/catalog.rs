//! Schema and reference introspection used to find fix candidates.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::error::{PipemendError, Result};

/// External "describe schema" and "list identifiers" capability.
pub trait SchemaCatalog: Send + Sync {
    /// Column names of a relation, or `None` when the relation is unknown.
    fn describe(&self, relation: &str) -> Result<Option<Vec<String>>>;

    /// Names of every known relation or unit.
    fn known_identifiers(&self) -> Result<Vec<String>>;
}

/// Normalise a relation reference for lookup: unquoted, lowercase, last segment.
pub fn relation_key(relation: &str) -> String {
    let unquoted = relation.replace(['"', '`'], "");
    unquoted
        .rsplit('.')
        .next()
        .unwrap_or(&unquoted)
        .trim()
        .to_lowercase()
}

/// In-memory catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticCatalog {
    relations: BTreeMap<String, Vec<String>>,
    identifiers: Vec<String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relation and its columns (builder pattern).
    pub fn with_relation<S: Into<String>>(
        mut self,
        name: &str,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.insert_relation(name, columns.into_iter().map(Into::into).collect());
        self
    }

    /// Add an identifier that has no known columns.
    pub fn with_identifier(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.identifiers.contains(&name) {
            self.identifiers.push(name);
        }
        self
    }

    pub fn insert_relation(&mut self, name: &str, columns: Vec<String>) {
        let display = name.rsplit('.').next().unwrap_or(name).to_string();
        if !self.identifiers.contains(&display) {
            self.identifiers.push(display);
        }
        self.relations.insert(relation_key(name), columns);
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty() && self.identifiers.is_empty()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }
}

impl SchemaCatalog for StaticCatalog {
    fn describe(&self, relation: &str) -> Result<Option<Vec<String>>> {
        Ok(self.relations.get(&relation_key(relation)).cloned())
    }

    fn known_identifiers(&self) -> Result<Vec<String>> {
        Ok(self.identifiers.clone())
    }
}

// ---------------------------------------------------------------------------
// dbt-style catalog.json
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    nodes: BTreeMap<String, CatalogNode>,
    #[serde(default)]
    sources: BTreeMap<String, CatalogNode>,
}

#[derive(Debug, Deserialize)]
struct CatalogNode {
    metadata: CatalogMetadata,
    #[serde(default)]
    columns: BTreeMap<String, CatalogColumn>,
}

#[derive(Debug, Deserialize)]
struct CatalogMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CatalogColumn {
    name: String,
    #[serde(default)]
    index: u32,
}

/// Loader for a dbt-style `catalog.json` (`nodes`/`sources` with columns).
pub struct CatalogFile;

impl CatalogFile {
    /// Parse catalog JSON into a [`StaticCatalog`].
    pub fn parse(json: &str) -> Result<StaticCatalog> {
        let doc: CatalogDocument = serde_json::from_str(json)
            .map_err(|e| PipemendError::Catalog(format!("invalid catalog document: {e}")))?;

        let mut catalog = StaticCatalog::new();
        for node in doc.nodes.into_values().chain(doc.sources.into_values()) {
            let mut columns: Vec<CatalogColumn> = node.columns.into_values().collect();
            columns.sort_by_key(|c| c.index);
            catalog.insert_relation(
                &node.metadata.name,
                columns.into_iter().map(|c| c.name).collect(),
            );
        }
        Ok(catalog)
    }

    /// Load a catalog file from disk.
    pub fn load(path: &Path) -> Result<StaticCatalog> {
        let json = std::fs::read_to_string(path)?;
        Self::parse(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_key_normalises() {
        assert_eq!(relation_key("\"main\".\"Orders\""), "orders");
        assert_eq!(relation_key("raw.orders"), "orders");
        assert_eq!(relation_key("stg_orders"), "stg_orders");
    }

    #[test]
    fn test_static_catalog_describe() {
        let catalog = StaticCatalog::new()
            .with_relation("main.orders", ["order_id", "ordered_at"])
            .with_identifier("stg_orders");

        let cols = catalog.describe("ORDERS").unwrap().expect("known relation");
        assert_eq!(cols, vec!["order_id", "ordered_at"]);
        assert!(catalog.describe("payments").unwrap().is_none());

        let ids = catalog.known_identifiers().unwrap();
        assert!(ids.contains(&"orders".to_string()));
        assert!(ids.contains(&"stg_orders".to_string()));
    }

    #[test]
    fn test_parse_catalog_json() {
        let json = r#"{
            "metadata": {"dbt_schema_version": "https://schemas.getdbt.com/dbt/catalog/v1.json"},
            "nodes": {
                "model.shop.stg_orders": {
                    "metadata": {"type": "VIEW", "schema": "main", "name": "stg_orders"},
                    "columns": {
                        "ORDERED_AT": {"type": "DATE", "index": 2, "name": "ordered_at"},
                        "ORDER_ID": {"type": "INTEGER", "index": 1, "name": "order_id"}
                    },
                    "stats": {}
                }
            },
            "sources": {
                "source.shop.raw.orders": {
                    "metadata": {"name": "orders"},
                    "columns": {}
                }
            },
            "errors": null
        }"#;

        let catalog = CatalogFile::parse(json).expect("parse");
        assert_eq!(catalog.relation_count(), 2);
        assert_eq!(
            catalog.describe("stg_orders").unwrap(),
            Some(vec!["order_id".to_string(), "ordered_at".to_string()])
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = CatalogFile::parse("not json").unwrap_err();
        assert!(err.to_string().contains("catalog error"));
    }
}
