use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::source::{Origin, Sources};
use crate::config::PrimaryTableSpec;
use crate::db::quote_ident;
use crate::{AppError, AppResult};

/// A timestamp cell as stored, ordered the way SQLite orders mixed values:
/// NULL, then numbers, then text, then blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Timestamp {
    pub fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Timestamp::Null,
            ValueRef::Integer(v) => Timestamp::Integer(v),
            ValueRef::Real(v) => Timestamp::Real(v),
            ValueRef::Text(bytes) => Timestamp::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Timestamp::Blob(bytes.to_vec()),
        }
    }

    /// NULL and empty text both count as "not recorded".
    pub fn is_absent(&self) -> bool {
        match self {
            Timestamp::Null => true,
            Timestamp::Text(text) => text.is_empty(),
            _ => false,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Timestamp::Null => 0,
            Timestamp::Integer(_) | Timestamp::Real(_) => 1,
            Timestamp::Text(_) => 2,
            Timestamp::Blob(_) => 3,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Timestamp::Integer(v) => Some(*v as f64),
            Timestamp::Real(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Null => f.write_str("NULL"),
            Timestamp::Integer(v) => write!(f, "{v}"),
            Timestamp::Real(v) => write!(f, "{v}"),
            Timestamp::Text(text) => f.write_str(text),
            Timestamp::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Timestamp::Integer(a), Timestamp::Integer(b)) => a.cmp(b),
            (Timestamp::Text(a), Timestamp::Text(b)) => a.cmp(b),
            (Timestamp::Blob(a), Timestamp::Blob(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

/// The minimal projection of one primary row used to pick winners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceQuote {
    pub id: i64,
    pub business_key: String,
    pub updated: Timestamp,
    pub created: Timestamp,
}

impl SourceQuote {
    pub fn effective_timestamp(&self) -> &Timestamp {
        if self.updated.is_absent() {
            &self.created
        } else {
            &self.updated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    UniqueToMain,
    UniqueToCopy,
    Overlapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRef {
    pub origin: Origin,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub business_key: String,
    pub classification: Classification,
    pub winner: RowRef,
    pub winner_effective: Timestamp,
    /// Present for overlapping keys only.
    pub loser_effective: Option<Timestamp>,
}

impl Decision {
    pub fn loser_origin(&self) -> Option<Origin> {
        match self.classification {
            Classification::Overlapping => Some(self.winner.origin.other()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSummary {
    pub unique_to_main: u64,
    pub unique_to_copy: u64,
    pub overlapping: u64,
    pub total: u64,
}

/// One decision per business key seen in either source, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DecisionSet {
    decisions: BTreeMap<String, Decision>,
}

impl DecisionSet {
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn get(&self, business_key: &str) -> Option<&Decision> {
        self.decisions.get(business_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.values()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Decision> {
        self.iter()
            .filter(|decision| decision.classification == Classification::Overlapping)
    }

    pub fn summary(&self) -> DecisionSummary {
        let mut summary = DecisionSummary::default();
        for decision in self.iter() {
            match decision.classification {
                Classification::UniqueToMain => summary.unique_to_main += 1,
                Classification::UniqueToCopy => summary.unique_to_copy += 1,
                Classification::Overlapping => summary.overlapping += 1,
            }
            summary.total += 1;
        }
        summary
    }
}

/// The copy wins only with a strictly later effective timestamp; ties keep main.
pub fn select_winner(main: &Timestamp, copy: &Timestamp) -> Origin {
    if copy > main {
        Origin::Copy
    } else {
        Origin::Main
    }
}

fn business_key_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(v.to_string()),
        ValueRef::Real(v) => Some(v.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Read the key projection of the primary table, keyed by business key.
///
/// Rows are read in identity order, so when a source holds the same key more
/// than once the row with the greatest identity is kept. Rows with a NULL key
/// have no business identity and are left out.
pub fn load_source_quotes(
    conn: &Connection,
    origin: Origin,
    spec: &PrimaryTableSpec,
    identity: &str,
) -> AppResult<BTreeMap<String, SourceQuote>> {
    let sql = format!(
        "SELECT {id}, CAST({key} AS TEXT), {updated}, {created} FROM {table} ORDER BY {id} ASC",
        id = quote_ident(identity),
        key = quote_ident(&spec.business_key),
        updated = quote_ident(&spec.updated_column),
        created = quote_ident(&spec.created_column),
        table = quote_ident(&spec.table),
    );
    let with_ctx = |err: rusqlite::Error| {
        AppError::from(err)
            .with_context("operation", "load_source_quotes")
            .with_context("table", spec.table.clone())
            .with_context("origin", origin.as_str())
    };

    let mut stmt = conn.prepare(&sql).map_err(with_ctx)?;
    let mut rows = stmt.query([]).map_err(with_ctx)?;
    let mut quotes = BTreeMap::new();
    let mut skipped_null = 0_u64;
    while let Some(row) = rows.next().map_err(with_ctx)? {
        let id: i64 = row.get(0).map_err(with_ctx)?;
        let Some(business_key) = business_key_text(row.get_ref(1).map_err(with_ctx)?) else {
            skipped_null += 1;
            continue;
        };
        let quote = SourceQuote {
            id,
            business_key: business_key.clone(),
            updated: Timestamp::from_value_ref(row.get_ref(2).map_err(with_ctx)?),
            created: Timestamp::from_value_ref(row.get_ref(3).map_err(with_ctx)?),
        };
        if let Some(previous) = quotes.insert(business_key, quote) {
            tracing::warn!(
                target: "quote_merge",
                event = "duplicate_business_key",
                origin = origin.as_str(),
                business_key = %previous.business_key,
                dropped_id = previous.id,
                kept_id = id,
            );
        }
    }
    if skipped_null > 0 {
        tracing::warn!(
            target: "quote_merge",
            event = "null_business_key_skipped",
            origin = origin.as_str(),
            rows = skipped_null,
        );
    }
    Ok(quotes)
}

/// Classify every business key from both sources and pick the winner for
/// each overlap.
pub fn analyze_conflicts(
    sources: &Sources,
    spec: &PrimaryTableSpec,
    identity: &str,
) -> AppResult<DecisionSet> {
    let main = load_source_quotes(sources.get(Origin::Main), Origin::Main, spec, identity)?;
    let mut copy = load_source_quotes(sources.get(Origin::Copy), Origin::Copy, spec, identity)?;
    Ok(classify(main, &mut copy))
}

fn classify(
    main: BTreeMap<String, SourceQuote>,
    copy: &mut BTreeMap<String, SourceQuote>,
) -> DecisionSet {
    let mut decisions = BTreeMap::new();
    for (key, main_row) in main {
        let decision = match copy.remove(&key) {
            Some(copy_row) => {
                let main_ts = main_row.effective_timestamp();
                let copy_ts = copy_row.effective_timestamp();
                let (winner, loser) = match select_winner(main_ts, copy_ts) {
                    Origin::Main => ((Origin::Main, &main_row), copy_ts),
                    Origin::Copy => ((Origin::Copy, &copy_row), main_ts),
                };
                Decision {
                    business_key: key.clone(),
                    classification: Classification::Overlapping,
                    winner: RowRef {
                        origin: winner.0,
                        id: winner.1.id,
                    },
                    winner_effective: winner.1.effective_timestamp().clone(),
                    loser_effective: Some(loser.clone()),
                }
            }
            None => Decision {
                business_key: key.clone(),
                classification: Classification::UniqueToMain,
                winner: RowRef {
                    origin: Origin::Main,
                    id: main_row.id,
                },
                winner_effective: main_row.effective_timestamp().clone(),
                loser_effective: None,
            },
        };
        decisions.insert(key, decision);
    }
    for (key, copy_row) in std::mem::take(copy) {
        decisions.insert(
            key.clone(),
            Decision {
                business_key: key,
                classification: Classification::UniqueToCopy,
                winner: RowRef {
                    origin: Origin::Copy,
                    id: copy_row.id,
                },
                winner_effective: copy_row.effective_timestamp().clone(),
                loser_effective: None,
            },
        );
    }
    DecisionSet { decisions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quote(id: i64, key: &str, updated: Timestamp, created: Timestamp) -> SourceQuote {
        SourceQuote {
            id,
            business_key: key.to_string(),
            updated,
            created,
        }
    }

    fn text(value: &str) -> Timestamp {
        Timestamp::Text(value.to_string())
    }

    fn keyed(rows: Vec<SourceQuote>) -> BTreeMap<String, SourceQuote> {
        rows.into_iter()
            .map(|row| (row.business_key.clone(), row))
            .collect()
    }

    #[test]
    fn effective_timestamp_falls_back_to_created() {
        let with_update = quote(1, "Q1", text("2024-02-01"), text("2024-01-01"));
        assert_eq!(with_update.effective_timestamp(), &text("2024-02-01"));
        let no_update = quote(2, "Q2", Timestamp::Null, text("2024-01-01"));
        assert_eq!(no_update.effective_timestamp(), &text("2024-01-01"));
        let empty_update = quote(3, "Q3", text(""), text("2024-01-03"));
        assert_eq!(empty_update.effective_timestamp(), &text("2024-01-03"));
    }

    #[test]
    fn ties_and_older_copies_keep_main() {
        assert_eq!(select_winner(&Timestamp::Integer(5), &Timestamp::Integer(5)), Origin::Main);
        assert_eq!(select_winner(&Timestamp::Integer(5), &Timestamp::Integer(4)), Origin::Main);
        assert_eq!(select_winner(&Timestamp::Integer(5), &Timestamp::Integer(9)), Origin::Copy);
        assert_eq!(select_winner(&Timestamp::Null, &Timestamp::Null), Origin::Main);
        assert_eq!(select_winner(&Timestamp::Null, &text("2024-01-01")), Origin::Copy);
    }

    #[test]
    fn mixed_values_follow_sqlite_ordering() {
        assert!(Timestamp::Null < Timestamp::Integer(i64::MIN));
        assert!(Timestamp::Integer(2) > Timestamp::Real(1.5));
        assert_eq!(Timestamp::Integer(2), Timestamp::Real(2.0));
        assert!(Timestamp::Integer(i64::MAX) < text("0"));
        assert!(text("zzz") < Timestamp::Blob(vec![0]));
    }

    #[test]
    fn classifies_the_reference_scenario() {
        let main = keyed(vec![
            quote(1, "Q1", Timestamp::Integer(5), Timestamp::Integer(0)),
            quote(2, "Q2", Timestamp::Integer(1), Timestamp::Integer(0)),
        ]);
        let mut copy = keyed(vec![
            quote(1, "Q1", Timestamp::Integer(9), Timestamp::Integer(0)),
            quote(2, "Q3", Timestamp::Integer(2), Timestamp::Integer(0)),
        ]);

        let set = classify(main, &mut copy);
        assert_eq!(
            set.summary(),
            DecisionSummary {
                unique_to_main: 1,
                unique_to_copy: 1,
                overlapping: 1,
                total: 3,
            }
        );
        let q1 = set.get("Q1").expect("Q1 decided");
        assert_eq!(q1.classification, Classification::Overlapping);
        assert_eq!(q1.winner, RowRef { origin: Origin::Copy, id: 1 });
        assert_eq!(q1.loser_origin(), Some(Origin::Main));
        assert_eq!(q1.loser_effective, Some(Timestamp::Integer(5)));
        assert_eq!(set.get("Q2").expect("Q2").winner.origin, Origin::Main);
        assert_eq!(set.get("Q3").expect("Q3").winner, RowRef { origin: Origin::Copy, id: 2 });
        assert_eq!(set.conflicts().count(), 1);
    }

    #[test]
    fn duplicate_keys_keep_the_greatest_identity() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "CREATE TABLE quotes (id INTEGER PRIMARY KEY, quote_no TEXT, created_at TEXT, updated_at TEXT);
             INSERT INTO quotes VALUES (1, 'Q1', 'a', 'a'), (2, 'Q1', 'b', 'b'), (3, NULL, 'c', 'c'), (4, 7, 'd', NULL);",
        )
        .expect("seed");

        let quotes = load_source_quotes(&conn, Origin::Main, &PrimaryTableSpec::default(), "id")
            .expect("load");
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes["Q1"].id, 2);
        assert_eq!(quotes["7"].effective_timestamp(), &text("d"));
    }

    #[test]
    fn whitespace_update_is_still_recorded() {
        let blank = quote(1, "Q1", text(" "), text("2024-01-03"));
        assert_eq!(blank.effective_timestamp(), &text(" "));
    }

    #[test]
    fn numeric_keys_use_sqlite_text_form() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "CREATE TABLE quotes (id INTEGER PRIMARY KEY, quote_no REAL, created_at TEXT, updated_at TEXT);
             INSERT INTO quotes VALUES (1, 1.0, 'a', 'a'), (2, 2.5, 'b', 'b');",
        )
        .expect("seed");

        let quotes = load_source_quotes(&conn, Origin::Main, &PrimaryTableSpec::default(), "id")
            .expect("load");
        let keys: Vec<&str> = quotes.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["1.0", "2.5"]);
    }

    fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
        prop_oneof![
            Just(Timestamp::Null),
            (0_i64..50).prop_map(Timestamp::Integer),
            "[0-9]{4}-0[1-9]-[0-2][0-9]".prop_map(Timestamp::Text),
        ]
    }

    fn side_strategy() -> impl Strategy<Value = BTreeMap<String, SourceQuote>> {
        proptest::collection::btree_map(
            "Q[0-9]{1,2}",
            (timestamp_strategy(), timestamp_strategy()),
            0..20,
        )
        .prop_map(|entries| {
            entries
                .into_iter()
                .enumerate()
                .map(|(idx, (key, (updated, created)))| {
                    let row = quote(idx as i64 + 1, &key, updated, created);
                    (key, row)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn every_key_is_decided_exactly_once(main in side_strategy(), copy in side_strategy()) {
            let mut keys: Vec<String> = main.keys().chain(copy.keys()).cloned().collect();
            keys.sort();
            keys.dedup();

            let set = classify(main.clone(), &mut copy.clone());
            let decided: Vec<String> = set.iter().map(|d| d.business_key.clone()).collect();
            prop_assert_eq!(&decided, &keys);

            let summary = set.summary();
            prop_assert_eq!(summary.total as usize, keys.len());
            prop_assert_eq!(
                summary.unique_to_main + summary.unique_to_copy + summary.overlapping,
                summary.total
            );
        }

        #[test]
        fn classification_is_deterministic(main in side_strategy(), copy in side_strategy()) {
            let first = classify(main.clone(), &mut copy.clone());
            let second = classify(main, &mut copy.clone());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn winner_never_has_the_older_timestamp(main in side_strategy(), copy in side_strategy()) {
            let set = classify(main.clone(), &mut copy.clone());
            for decision in set.conflicts() {
                let main_ts = main[&decision.business_key].effective_timestamp();
                let copy_ts = copy[&decision.business_key].effective_timestamp();
                match decision.winner.origin {
                    Origin::Main => prop_assert!(main_ts >= copy_ts),
                    Origin::Copy => prop_assert!(copy_ts > main_ts),
                }
            }
        }
    }
}
