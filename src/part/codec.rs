//! On-disk column codec.
//!
//! A column file is `[encoding u8][type u8][rows u64-le][payload]` followed
//! by a CRC32 of everything before it. Dense payloads store one cell per
//! row; sparse payloads store the column default once plus the non-default
//! cells as `(row, cell)` pairs, so partial truncation is always detectable.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::value::{DataType, Value};

const ENCODING_DENSE: u8 = 0;
const ENCODING_SPARSE: u8 = 1;

fn type_tag(data_type: DataType) -> u8 {
    match data_type {
        DataType::UInt64 => 0,
        DataType::Int64 => 1,
        DataType::Float64 => 2,
        DataType::String => 3,
    }
}

fn type_from_tag(tag: u8) -> Result<DataType> {
    Ok(match tag {
        0 => DataType::UInt64,
        1 => DataType::Int64,
        2 => DataType::Float64,
        3 => DataType::String,
        other => return Err(Error::corrupted(format!("unknown column type tag {other}"))),
    })
}

fn write_cell(out: &mut Vec<u8>, data_type: DataType, value: &Value) -> Result<()> {
    match value {
        Value::Null => {
            out.write_u8(0)?;
            return Ok(());
        }
        _ => out.write_u8(1)?,
    }
    match (data_type, value) {
        (DataType::UInt64, Value::UInt64(v)) => out.write_u64::<LittleEndian>(*v)?,
        (DataType::Int64, Value::Int64(v)) => out.write_i64::<LittleEndian>(*v)?,
        (DataType::Float64, Value::Float64(v)) => out.write_f64::<LittleEndian>(*v)?,
        (DataType::String, Value::String(v)) => {
            out.write_u32::<LittleEndian>(v.len() as u32)?;
            out.extend_from_slice(v.as_bytes());
        }
        (dt, v) => {
            return Err(Error::logical(format!(
                "cell {v:?} does not match column type {dt:?}"
            )))
        }
    }
    Ok(())
}

fn read_cell(input: &mut &[u8], data_type: DataType) -> Result<Value> {
    let present = input.read_u8()?;
    if present == 0 {
        return Ok(Value::Null);
    }
    Ok(match data_type {
        DataType::UInt64 => Value::UInt64(input.read_u64::<LittleEndian>()?),
        DataType::Int64 => Value::Int64(input.read_i64::<LittleEndian>()?),
        DataType::Float64 => Value::Float64(input.read_f64::<LittleEndian>()?),
        DataType::String => {
            let len = input.read_u32::<LittleEndian>()? as usize;
            let current: &[u8] = input;
            if current.len() < len {
                return Err(Error::corrupted("string cell overruns column file"));
            }
            let (bytes, rest) = current.split_at(len);
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::corrupted("non-utf8 string cell"))?
                .to_string();
            *input = rest;
            Value::String(s)
        }
    })
}

/// Encode a whole column into `path`. `sparse_default` switches on the
/// sparse layout with the given default cell.
pub(crate) fn encode_column(
    path: &Path,
    data_type: DataType,
    values: &[Value],
    sparse_default: Option<&Value>,
) -> Result<()> {
    let mut body = Vec::with_capacity(values.len() * 9 + 16);
    match sparse_default {
        None => {
            body.write_u8(ENCODING_DENSE)?;
            body.write_u8(type_tag(data_type))?;
            body.write_u64::<LittleEndian>(values.len() as u64)?;
            for value in values {
                write_cell(&mut body, data_type, value)?;
            }
        }
        Some(default) => {
            body.write_u8(ENCODING_SPARSE)?;
            body.write_u8(type_tag(data_type))?;
            body.write_u64::<LittleEndian>(values.len() as u64)?;
            write_cell(&mut body, data_type, default)?;
            let non_default: Vec<(u64, &Value)> = values
                .iter()
                .enumerate()
                .filter(|(_, v)| *v != default)
                .map(|(i, v)| (i as u64, v))
                .collect();
            body.write_u64::<LittleEndian>(non_default.len() as u64)?;
            for (row, value) in non_default {
                body.write_u64::<LittleEndian>(row)?;
                write_cell(&mut body, data_type, value)?;
            }
        }
    }
    let crc = crc32fast::hash(&body);
    body.write_u32::<LittleEndian>(crc)?;

    let mut file = File::create(path)?;
    file.write_all(&body)?;
    Ok(())
}

/// Decode a whole column file.
pub(crate) fn decode_column(path: &Path) -> Result<(DataType, Vec<Value>)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::corrupted(format!(
            "column file {} is truncated",
            path.display()
        )));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = (&mut &crc_bytes[..]).read_u32::<LittleEndian>()?;
    if crc32fast::hash(body) != stored_crc {
        return Err(Error::corrupted(format!(
            "crc mismatch in column file {}",
            path.display()
        )));
    }

    let mut input = body;
    let encoding = input.read_u8()?;
    let data_type = type_from_tag(input.read_u8()?)?;
    let rows = input.read_u64::<LittleEndian>()? as usize;
    let values = match encoding {
        ENCODING_DENSE => {
            let mut values = Vec::with_capacity(rows);
            for _ in 0..rows {
                values.push(read_cell(&mut input, data_type)?);
            }
            values
        }
        ENCODING_SPARSE => {
            let default = read_cell(&mut input, data_type)?;
            let mut values = vec![default; rows];
            let pairs = input.read_u64::<LittleEndian>()? as usize;
            for _ in 0..pairs {
                let row = input.read_u64::<LittleEndian>()? as usize;
                if row >= rows {
                    return Err(Error::corrupted("sparse row index out of range"));
                }
                values[row] = read_cell(&mut input, data_type)?;
            }
            values
        }
        other => {
            return Err(Error::corrupted(format!(
                "unknown column encoding {other}"
            )))
        }
    };
    if !input.is_empty() {
        return Err(Error::corrupted(format!(
            "trailing bytes in column file {}",
            path.display()
        )));
    }
    Ok((data_type, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        let values = vec![
            Value::String("a".into()),
            Value::Null,
            Value::String("long enough to matter".into()),
        ];
        encode_column(&path, DataType::String, &values, None).unwrap();
        let (dt, decoded) = decode_column(&path).unwrap();
        assert_eq!(dt, DataType::String);
        assert_eq!(decoded, values);
    }

    #[test]
    fn sparse_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        let mut values = vec![Value::UInt64(0); 100];
        values[13] = Value::UInt64(7);
        values[99] = Value::UInt64(9);
        encode_column(&path, DataType::UInt64, &values, Some(&Value::UInt64(0))).unwrap();
        let (_, decoded) = decode_column(&path).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        encode_column(&path, DataType::UInt64, &[Value::UInt64(5)], None).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            decode_column(&path),
            Err(crate::error::Error::Corrupted(_))
        ));
    }
}
