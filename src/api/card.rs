//! API operations concerning cards (saved questions).

use serde::{Deserialize, Serialize};

use crate::api::{ApiRequest, JsonResponse};

/// A raw result row, keyed by column display name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Load the metadata for a card, including its result columns.
#[derive(Debug, Clone, Copy)]
pub struct GetCard {
    /// The id of the card.
    pub card_id: u64,
}

/// A card as reported by the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Card {
    /// The card's human-readable name.
    pub name: String,
    /// The result columns, in the order the query returns them. Absent for
    /// cards that have never been run.
    #[serde(default)]
    pub result_metadata: Option<Vec<ColumnDescriptor>>,
}

impl JsonResponse for Card {}

/// A result column reported by the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnDescriptor {
    /// The column name.
    pub name: String,
    /// The column label shown to users. Raw rows are keyed by this.
    pub display_name: String,
    /// A dotted type tag, e.g. `type/Integer`.
    pub base_type: String,
    /// Statistics gathered when the card was last run.
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
}

impl ColumnDescriptor {
    /// The fraction of null values observed for this column, or 0 if no
    /// statistics were gathered.
    pub fn nil_ratio(&self) -> f64 {
        self.fingerprint
            .as_ref()
            .and_then(|f| f.global.as_ref())
            .and_then(|g| g.nil_ratio)
            .unwrap_or(0.0)
    }
}

/// Column statistics.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Fingerprint {
    /// Statistics that apply regardless of the column type.
    #[serde(default)]
    pub global: Option<GlobalFingerprint>,
}

/// Type-independent column statistics.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GlobalFingerprint {
    /// The fraction of null values.
    #[serde(rename = "nil%", default)]
    pub nil_ratio: Option<f64>,
}

impl ApiRequest for GetCard {
    type Response = Card;

    fn path(&self) -> String {
        format!("card/{}", self.card_id)
    }
}

/// Run a card and fetch every result row as JSON.
#[derive(Debug, Clone, Copy)]
pub struct QueryCard<'a> {
    /// The id of the card.
    pub card_id: u64,
    /// The card parameters, already serialized as a JSON array.
    pub parameters: Option<&'a str>,
}

#[derive(Serialize)]
struct QueryCardForm<'a> {
    parameters: &'a str,
}

impl JsonResponse for Vec<Row> {}

impl ApiRequest for QueryCard<'_> {
    type Response = Vec<Row>;

    fn method(&self) -> http::Method {
        http::Method::POST
    }

    fn path(&self) -> String {
        format!("card/{}/query/json", self.card_id)
    }

    fn form(&self) -> Option<impl Serialize> {
        self.parameters.map(|parameters| QueryCardForm { parameters })
    }
}
