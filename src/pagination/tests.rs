use serde::{Deserialize, Serialize};

use super::*;
use crate::engine::Engine;
use crate::keycodec::{is_index_key, primary_key};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Item {
    id: String,
    deleted: bool,
}

fn insert(tx: &WriteTxCtx, id: &str, deleted: bool) {
    let item = Item {
        id: id.to_string(),
        deleted,
    };
    tx.set(&primary_key("item", id), &serde_json::to_vec(&item).unwrap())
        .unwrap();
}

fn decode(bytes: &[u8]) -> StoreResult<Option<Item>> {
    Ok(Some(serde_json::from_slice(bytes).unwrap()))
}

#[test]
fn paginates_in_primary_key_order_with_cursor_chaining() {
    let engine = Engine::open_in_memory().unwrap();
    let prefix = crate::keycodec::entity_prefix("item");

    engine
        .write_retrying(|tx| {
            for i in 1..=5 {
                insert(tx, &format!("i-{i}"), false);
            }

            let req = PageRequest {
                limit: Some(2),
                cursor: None,
            };
            let page1 = paginate_prefix(
                tx,
                &prefix,
                &req,
                |k| is_index_key(&prefix, k),
                decode,
                |item: &Item| item.deleted,
            )
            .unwrap();
            assert_eq!(page1.items.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec!["i-1", "i-2"]);
            assert!(page1.has_more);

            let req2 = PageRequest {
                limit: Some(2),
                cursor: page1.next_cursor.clone(),
            };
            let page2 = paginate_prefix(
                tx,
                &prefix,
                &req2,
                |k| is_index_key(&prefix, k),
                decode,
                |item: &Item| item.deleted,
            )
            .unwrap();
            assert_eq!(page2.items.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec!["i-3", "i-4"]);
            assert!(page2.has_more);

            let req3 = PageRequest {
                limit: Some(2),
                cursor: page2.next_cursor.clone(),
            };
            let page3 = paginate_prefix(
                tx,
                &prefix,
                &req3,
                |k| is_index_key(&prefix, k),
                decode,
                |item: &Item| item.deleted,
            )
            .unwrap();
            assert_eq!(page3.items.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec!["i-5"]);
            assert!(!page3.has_more);
            assert!(page3.next_cursor.is_none());

            Ok(())
        })
        .unwrap();
}

#[test]
fn skips_soft_deleted_when_peeking_for_has_more() {
    let engine = Engine::open_in_memory().unwrap();
    let prefix = crate::keycodec::entity_prefix("item");

    engine
        .write_retrying(|tx| {
            insert(tx, "i-1", false);
            insert(tx, "i-2", true); // soft-deleted, should never surface
            insert(tx, "i-3", false);

            let req = PageRequest {
                limit: Some(2),
                cursor: None,
            };
            let page = paginate_prefix(
                tx,
                &prefix,
                &req,
                |k| is_index_key(&prefix, k),
                decode,
                |item: &Item| item.deleted,
            )
            .unwrap();

            assert_eq!(page.items.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec!["i-1", "i-3"]);
            assert!(!page.has_more);
            Ok(())
        })
        .unwrap();
}
