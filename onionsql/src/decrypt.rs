//! Turns physical result sets back into plaintext.

use tracing::trace;

use crate::capability::Olk;
use crate::error::Error;
use crate::schema::SchemaMetadata;
use crate::store::ResultSet;
use crate::value::Value;

/// How one physical output column is decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnField {
    /// Name the client sees
    pub name: String,
    /// Representation the column was produced in
    pub olk: Olk,
    /// Salt columns are consumed and not returned
    pub is_salt: bool,
    /// Physical position of this column's salt, if it has one
    pub salt_index: Option<usize>,
}

/// Decryption plan for a result set, one entry per physical column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnMeta {
    /// Physical output columns in order
    pub fields: Vec<ReturnField>,
}

impl ReturnMeta {
    /// Names of the columns the client sees.
    pub fn visible_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter(|f| !f.is_salt).map(|f| f.name.as_str())
    }
}

/// Decrypts every row of `rs` according to `meta`.
///
/// # Errors
///
/// Returns `Error::MissingSalt` if a salted column comes back without its
/// salt, `Error::DecryptionFailed` if the result does not match `meta`, or a
/// layer error.
pub fn decrypt_results(schema: &SchemaMetadata, meta: &ReturnMeta, rs: &ResultSet) -> Result<ResultSet, Error> {
    if rs.columns.len() != meta.fields.len() {
        return Err(Error::DecryptionFailed(format!(
            "result has {} columns, expected {}",
            rs.columns.len(),
            meta.fields.len()
        )));
    }

    let mut out = ResultSet::new(meta.visible_names().map(str::to_string).collect());
    for row in &rs.rows {
        let mut plain = Vec::with_capacity(out.columns.len());
        for (field, value) in meta.fields.iter().zip(row) {
            if field.is_salt {
                continue;
            }
            plain.push(decrypt_value(schema, field, value, row)?);
        }
        out.rows.push(plain);
    }
    trace!(rows = out.len(), "decrypted result set");
    Ok(out)
}

fn decrypt_value(schema: &SchemaMetadata, field: &ReturnField, value: &Value, row: &[Value]) -> Result<Value, Error> {
    let olk = &field.olk;
    if olk.is_plain() || value.is_null() {
        return Ok(value.clone());
    }
    let Some(field_ref) = &olk.field else {
        return Err(Error::DecryptionFailed(format!(
            "`{}` is encrypted at {olk} but bound to no column",
            field.name
        )));
    };

    let salt = if olk.level.needs_salt() {
        let raw = field
            .salt_index
            .and_then(|i| row.get(i))
            .and_then(Value::as_integer)
            .ok_or_else(|| Error::MissingSalt { column: field.name.clone() })?;
        u64::try_from(raw).map_err(|_| Error::DecryptionFailed(format!("negative salt for `{}`", field.name)))?
    } else {
        0
    };

    schema.field(field_ref)?.onion(olk.onion)?.decrypt_from(value, olk.level, salt)
}

#[cfg(test)]
mod tests {
    use secrecy::SecretVec;

    use super::*;
    use crate::crypto::{Onion, SecLevel, SqlType};
    use crate::schema::FieldRef;

    fn schema() -> (SchemaMetadata, FieldRef) {
        let master = SecretVec::new(vec![3; 32]);
        let mut schema = SchemaMetadata::new();
        schema.create_table("db", "t").unwrap();
        let field_ref = FieldRef::new("db", "t", "a");
        let field = schema.build_field(field_ref.clone(), SqlType::Integer, true, &master).unwrap();
        schema.table_mut("db", "t").unwrap().create_field(field).unwrap();
        (schema, field_ref)
    }

    fn olk(field: &FieldRef, onion: Onion, level: SecLevel) -> Olk {
        Olk { onion, level, field: Some(field.clone()) }
    }

    #[test]
    fn test_rnd_with_salt() {
        let (schema, a) = schema();
        let onion = schema.field(&a).unwrap().onion(Onion::Det).unwrap();
        let ct = onion.encrypt_to(&Value::Integer(42), SecLevel::Rnd, 77).unwrap();

        let meta = ReturnMeta {
            fields: vec![
                ReturnField { name: "a".into(), olk: olk(&a, Onion::Det, SecLevel::Rnd), is_salt: false, salt_index: Some(1) },
                ReturnField { name: "a$salt".into(), olk: olk(&a, Onion::Det, SecLevel::Rnd), is_salt: true, salt_index: None },
            ],
        };
        let mut rs = ResultSet::new(vec!["c".into(), "s".into()]);
        rs.rows.push(vec![ct, Value::Integer(77)]);
        rs.rows.push(vec![Value::Null, Value::Null]);

        let out = decrypt_results(&schema, &meta, &rs).unwrap();
        assert_eq!(out.columns, vec!["a".to_string()]);
        assert_eq!(out.rows, vec![vec![Value::Integer(42)], vec![Value::Null]]);
    }

    #[test]
    fn test_missing_salt() {
        let (schema, a) = schema();
        let onion = schema.field(&a).unwrap().onion(Onion::Det).unwrap();
        let ct = onion.encrypt_to(&Value::Integer(1), SecLevel::Rnd, 5).unwrap();
        let meta = ReturnMeta {
            fields: vec![ReturnField {
                name: "a".into(),
                olk: olk(&a, Onion::Det, SecLevel::Rnd),
                is_salt: false,
                salt_index: None,
            }],
        };
        let mut rs = ResultSet::new(vec!["c".into()]);
        rs.rows.push(vec![ct]);
        assert!(matches!(decrypt_results(&schema, &meta, &rs), Err(Error::MissingSalt { .. })));
    }

    fn unbound() -> ReturnMeta {
        ReturnMeta {
            fields: vec![
                ReturnField { name: "n".into(), olk: Olk::plain(), is_salt: false, salt_index: None },
                ReturnField {
                    name: "j".into(),
                    olk: Olk { onion: Onion::Det, level: SecLevel::DetJoin, field: None },
                    is_salt: false,
                    salt_index: None,
                },
            ],
        }
    }

    #[test]
    fn test_plain_passes_through() {
        let (schema, _) = schema();
        let mut rs = ResultSet::new(vec!["n".into(), "j".into()]);
        rs.rows.push(vec![Value::Integer(3), Value::Null]);
        let out = decrypt_results(&schema, &unbound(), &rs).unwrap();
        assert_eq!(out.rows[0], vec![Value::Integer(3), Value::Null]);
    }

    #[test]
    fn test_unbound_ciphertext_is_rejected() {
        let (schema, _) = schema();
        let mut rs = ResultSet::new(vec!["n".into(), "j".into()]);
        rs.rows.push(vec![Value::Integer(3), Value::Blob(vec![1, 2])]);
        assert!(matches!(decrypt_results(&schema, &unbound(), &rs), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_width_mismatch() {
        let (schema, _) = schema();
        let rs = ResultSet::new(vec!["x".into()]);
        assert!(decrypt_results(&schema, &ReturnMeta::default(), &rs).is_err());
    }
}
