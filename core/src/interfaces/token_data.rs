//! Token metadata (TEP-64 style content cells).
//!
//! Failures here are never fatal for detection: callers log and leave the
//! content field empty.

use sha2::{Digest, Sha256};
use tondex_models::TokenContent;
use tycho_types::cell::{Cell, CellSlice, HashBytes, Load};
use tycho_types::prelude::Dict;

use crate::{IndexerError, Result};

const ONCHAIN_CONTENT_TAG: u8 = 0x00;
const OFFCHAIN_CONTENT_TAG: u8 = 0x01;
const SNAKE_DATA_TAG: u8 = 0x00;
const CHUNKED_DATA_TAG: u8 = 0x01;

/// Attribute names the on-chain layout may carry, hashed into dict keys.
const KNOWN_ATTRIBUTES: [&str; 9] = [
    "uri",
    "name",
    "description",
    "image",
    "image_data",
    "symbol",
    "decimals",
    "amount_style",
    "render_type",
];

/// Parses a content cell into an attribute map.
pub fn parse_token_data(cell: &Cell) -> Result<TokenContent> {
    let malformed = |_| IndexerError::InterfaceParse("malformed token content");
    let mut cs = cell.as_slice().map_err(malformed)?;

    match cs.load_u8().map_err(malformed)? {
        OFFCHAIN_CONTENT_TAG => {
            let uri = load_string_tail(&mut cs)?;
            let mut content = TokenContent::new();
            content.insert("uri".to_owned(), uri);
            Ok(content)
        }
        ONCHAIN_CONTENT_TAG => {
            let dict = Dict::<HashBytes, Cell>::load_from(&mut cs).map_err(malformed)?;
            let mut content = TokenContent::new();
            for attribute in KNOWN_ATTRIBUTES {
                let key = attribute_key(attribute);
                let Some(value_cell) = dict.get(key).map_err(malformed)? else {
                    continue;
                };
                match parse_attribute_value(&value_cell) {
                    Ok(value) => {
                        content.insert(attribute.to_owned(), value);
                    }
                    Err(e) => {
                        tracing::warn!(attribute, "skipping unreadable content attribute: {e}");
                    }
                }
            }
            Ok(content)
        }
        _ => Err(IndexerError::InterfaceParse("unknown token content tag")),
    }
}

fn attribute_key(attribute: &str) -> HashBytes {
    let digest: [u8; 32] = Sha256::digest(attribute.as_bytes()).into();
    HashBytes::from(digest)
}

fn parse_attribute_value(cell: &Cell) -> Result<String> {
    let malformed = |_| IndexerError::InterfaceParse("malformed content attribute");
    let mut cs = cell.as_slice().map_err(malformed)?;

    match cs.load_u8().map_err(malformed)? {
        SNAKE_DATA_TAG => load_string_tail(&mut cs),
        CHUNKED_DATA_TAG => Err(IndexerError::InterfaceParse(
            "chunked content is not supported",
        )),
        _ => Err(IndexerError::InterfaceParse("unknown content data tag")),
    }
}

/// Reads the rest of the slice plus the chained references ("snake" data)
/// as UTF-8. Snake data always continues through the first reference.
fn load_string_tail(cs: &mut CellSlice<'_>) -> Result<String> {
    let malformed = |_| IndexerError::InterfaceParse("malformed snake data");

    let mut bytes = Vec::new();
    let mut next = read_data_and_next(cs, &mut bytes).map_err(malformed)?;
    while let Some(cell) = next {
        let mut cs = cell.as_slice().map_err(malformed)?;
        next = read_data_and_next(&mut cs, &mut bytes).map_err(malformed)?;
    }

    String::from_utf8(bytes).map_err(|_| IndexerError::InterfaceParse("snake data is not utf-8"))
}

fn read_data_and_next(
    cs: &mut CellSlice<'_>,
    bytes: &mut Vec<u8>,
) -> std::result::Result<Option<Cell>, tycho_types::error::Error> {
    let bits = cs.size_bits() & !7;
    let mut buffer = vec![0u8; bits as usize / 8];
    let loaded = cs.load_raw(&mut buffer, bits)?;
    bytes.extend_from_slice(loaded);

    if cs.size_refs() > 0 {
        cs.load_reference_cloned().map(Some)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use tycho_types::cell::{CellBuilder, CellFamily, Store};

    use super::*;

    fn snake_cell(tag: u8, text: &str) -> Cell {
        let (head_part, tail_part) = text.split_at(text.len() / 2);

        let mut tail = CellBuilder::new();
        tail.store_raw(tail_part.as_bytes(), (tail_part.len() * 8) as u16)
            .unwrap();
        let tail = tail.build().unwrap();

        let mut head = CellBuilder::new();
        head.store_u8(tag).unwrap();
        head.store_raw(head_part.as_bytes(), (head_part.len() * 8) as u16)
            .unwrap();
        head.store_reference(tail).unwrap();
        head.build().unwrap()
    }

    #[test]
    fn parses_offchain_content() {
        let uri = "https://example.com/token.json";
        let cell = snake_cell(OFFCHAIN_CONTENT_TAG, uri);

        let content = parse_token_data(&cell).unwrap();
        assert_eq!(content.get("uri").map(String::as_str), Some(uri));
    }

    #[test]
    fn parses_onchain_attributes() {
        let mut dict = Dict::<HashBytes, Cell>::new();
        dict.set(attribute_key("name"), snake_cell(SNAKE_DATA_TAG, "Sample"))
            .unwrap();
        dict.set(attribute_key("symbol"), snake_cell(SNAKE_DATA_TAG, "SMP"))
            .unwrap();

        let mut b = CellBuilder::new();
        b.store_u8(ONCHAIN_CONTENT_TAG).unwrap();
        dict.store_into(&mut b, Cell::empty_context()).unwrap();
        let cell = b.build().unwrap();

        let content = parse_token_data(&cell).unwrap();
        assert_eq!(content.get("name").map(String::as_str), Some("Sample"));
        assert_eq!(content.get("symbol").map(String::as_str), Some("SMP"));
        assert!(!content.contains_key("decimals"));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut b = CellBuilder::new();
        b.store_u8(0x42).unwrap();
        let cell = b.build().unwrap();

        assert!(matches!(
            parse_token_data(&cell),
            Err(IndexerError::InterfaceParse(_))
        ));
    }
}
