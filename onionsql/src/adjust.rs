//! Onion adjustment: peeling layers off a column in the live store.
//!
//! Each peel is one `UPDATE` that runs `onion_peel` over the whole column,
//! bracketed by an intent row in the metadata mirror. The intent is written
//! before the store is touched and cleared in the same mirror transaction
//! that records the new level, so a crash in between is detected on the next
//! start. A peel the store rejects never applied, so its intent is dropped.

use std::fmt;

use tracing::{debug, info, warn};

use crate::crypto::{Onion, SecLevel};
use crate::error::Error;
use crate::schema::mirror::MetaMirror;
use crate::schema::{FieldRef, SchemaMetadata};
use crate::sql::{Assignment, Expr, Statement, Update};
use crate::store::Backend;

/// A request to lower one onion of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentRequest {
    /// Field whose onion is peeled
    pub field: FieldRef,
    /// Onion to peel
    pub onion: Onion,
    /// Level to stop at
    pub target: SecLevel,
}

impl fmt::Display for AdjustmentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} onion of {} down to {}", self.onion, self.field, self.target)
    }
}

/// Peels the requested onion layer by layer until it reaches the target.
///
/// Returns the level the onion ends at. A target equal to the current level
/// is a no-op.
///
/// # Errors
///
/// Returns `Error::AdjustmentImpossible` if the target is above the current
/// level or not on the onion's chain, `Error::MetadataConflict` if the field
/// is unknown, and store or mirror errors from the peel itself. A store
/// failure discards the intent and leaves the level unchanged.
pub fn adjust_onion<B: Backend>(
    schema: &mut SchemaMetadata,
    mirror: &mut MetaMirror,
    live: &mut B,
    request: &AdjustmentRequest,
) -> Result<SecLevel, Error> {
    let anon_table = schema.table(&request.field.database, &request.field.table)?.anon_name().to_string();
    let field = schema.field_mut(&request.field)?;
    let salt_column = field.salt_name().map(str::to_string);
    let onion = field.onion_mut(request.onion)?;

    let current = onion.level();
    if request.target > current || !request.onion.contains(request.target) {
        return Err(Error::AdjustmentImpossible {
            onion: request.onion,
            field: request.field.to_string(),
            current,
            target: request.target,
        });
    }

    while onion.level() > request.target {
        let Some(layer) = onion.outermost() else {
            break;
        };
        let from = layer.level();
        let to = onion.layers().iter().rev().nth(1).map_or(SecLevel::PlainVal, |below| below.level());
        let column = onion.anon_name().to_string();

        let peel = Statement::Update(Update {
            table: anon_table.clone(),
            assignments: vec![Assignment {
                column: column.clone(),
                value: Expr::func(
                    "onion_peel",
                    vec![
                        Expr::col(column.clone()),
                        salt_column.as_ref().map_or_else(Expr::null, |salt| Expr::col(salt.clone())),
                        Expr::lit(layer.to_bytes()?),
                    ],
                ),
            }],
            filter: None,
        });

        let intent = mirror.begin_adjustment(&column, from, to)?;
        debug!(onion = %column, %from, %to, intent, "peeling layer");
        if let Err(err) = live.execute(&peel.to_string()) {
            warn!(onion = %column, intent, error = %err, "peel rejected by store");
            mirror.abort_adjustment(intent)?;
            return Err(err);
        }
        onion.pop_layer();
        mirror.finish_peel(intent, &column, from, to)?;
        info!(field = %request.field, onion = %request.onion, %from, %to, "onion adjusted");
    }

    Ok(onion.level())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretVec;

    use super::*;
    use crate::crypto::SqlType;
    use crate::store::SqliteBackend;
    use crate::value::Value;

    struct Fixture {
        schema: SchemaMetadata,
        mirror: MetaMirror,
        live: SqliteBackend,
        field: FieldRef,
    }

    fn fixture() -> Fixture {
        let master = SecretVec::new(vec![9; 32]);
        let mut schema = SchemaMetadata::new();
        let mut mirror = MetaMirror::open(None).unwrap();
        let mut live = SqliteBackend::in_memory().unwrap();

        schema.create_table("db", "t").unwrap();
        let field_ref = FieldRef::new("db", "t", "a");
        let field = schema.build_field(field_ref.clone(), SqlType::Integer, true, &master).unwrap();
        schema.table_mut("db", "t").unwrap().create_field(field).unwrap();
        let table = schema.table("db", "t").unwrap();
        mirror.insert_table(table).unwrap();

        let field = table.field("a").unwrap();
        let columns: Vec<String> = field.physical_columns().iter().map(|(n, _)| n.clone()).collect();
        live.execute(&format!("CREATE TABLE {} ({})", table.anon_name(), columns.join(", "))).unwrap();

        let salt = 1234;
        let values: Vec<String> = field
            .onions()
            .map(|(_, om)| om.encrypt_to(&Value::Integer(7), om.level(), salt).unwrap().to_string())
            .chain(std::iter::once(salt.to_string()))
            .collect();
        live.execute(&format!("INSERT INTO {} VALUES ({})", table.anon_name(), values.join(", "))).unwrap();

        Fixture { schema, mirror, live, field: field_ref }
    }

    #[test]
    fn test_peel_det_to_det_join() {
        let mut fx = fixture();
        let request = AdjustmentRequest { field: fx.field.clone(), onion: Onion::Det, target: SecLevel::DetJoin };
        let level = adjust_onion(&mut fx.schema, &mut fx.mirror, &mut fx.live, &request).unwrap();
        assert_eq!(level, SecLevel::DetJoin);
        assert!(fx.mirror.pending_adjustments().unwrap().is_empty());

        let onion = fx.schema.field(&fx.field).unwrap().onion(Onion::Det).unwrap();
        let table = fx.schema.table("db", "t").unwrap().anon_name().to_string();
        let rs = fx.live.execute(&format!("SELECT {} FROM {table}", onion.anon_name())).unwrap();
        let plain = onion.decrypt_from(&rs.rows[0][0], SecLevel::DetJoin, 0).unwrap();
        assert_eq!(plain, Value::Integer(7));

        let reloaded = fx.mirror.load().unwrap();
        assert_eq!(reloaded.field(&fx.field).unwrap().onion(Onion::Det).unwrap().level(), SecLevel::DetJoin);
    }

    #[test]
    fn test_same_level_is_noop() {
        let mut fx = fixture();
        let request = AdjustmentRequest { field: fx.field.clone(), onion: Onion::Hom, target: SecLevel::Hom };
        assert_eq!(adjust_onion(&mut fx.schema, &mut fx.mirror, &mut fx.live, &request).unwrap(), SecLevel::Hom);
    }

    #[test]
    fn test_impossible_targets() {
        let mut fx = fixture();
        let below_chain = AdjustmentRequest { field: fx.field.clone(), onion: Onion::Det, target: SecLevel::PlainVal };
        assert!(matches!(
            adjust_onion(&mut fx.schema, &mut fx.mirror, &mut fx.live, &below_chain),
            Err(Error::AdjustmentImpossible { .. })
        ));

        let down = AdjustmentRequest { field: fx.field.clone(), onion: Onion::Ord, target: SecLevel::Ope };
        adjust_onion(&mut fx.schema, &mut fx.mirror, &mut fx.live, &down).unwrap();
        let up = AdjustmentRequest { field: fx.field.clone(), onion: Onion::Ord, target: SecLevel::Rnd };
        assert!(matches!(
            adjust_onion(&mut fx.schema, &mut fx.mirror, &mut fx.live, &up),
            Err(Error::AdjustmentImpossible { current: SecLevel::Ope, .. })
        ));
    }

    #[test]
    fn test_store_failure_discards_intent() {
        let mut fx = fixture();
        let table = fx.schema.table("db", "t").unwrap().anon_name().to_string();
        fx.live.execute(&format!("DROP TABLE {table}")).unwrap();

        let request = AdjustmentRequest { field: fx.field.clone(), onion: Onion::Det, target: SecLevel::Det };
        assert!(matches!(
            adjust_onion(&mut fx.schema, &mut fx.mirror, &mut fx.live, &request),
            Err(Error::Store(_))
        ));
        assert!(fx.mirror.pending_adjustments().unwrap().is_empty());
        assert_eq!(fx.schema.field(&fx.field).unwrap().onion(Onion::Det).unwrap().level(), SecLevel::Rnd);
        let reloaded = fx.mirror.load().unwrap();
        assert_eq!(reloaded.field(&fx.field).unwrap().onion(Onion::Det).unwrap().level(), SecLevel::Rnd);
    }

    #[test]
    fn test_display() {
        let request = AdjustmentRequest {
            field: FieldRef::new("db", "t", "a"),
            onion: Onion::Ord,
            target: SecLevel::Ope,
        };
        assert_eq!(request.to_string(), "ORD onion of db.t.a down to OPE");
    }
}
