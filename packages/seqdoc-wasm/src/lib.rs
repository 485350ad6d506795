#![forbid(unsafe_code)]
//! WASM-friendly bridge for seqdoc.
//! Exposes a small wasm-bindgen surface over root branches and binary updates.

use serde::Serialize;
use serde_wasm_bindgen::to_value;
use seqdoc_core::{
    decode_state_vector, Block, BranchRef, Content, Document, ReplicaId, Value,
};
use wasm_bindgen::prelude::*;

fn to_js_err(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn replica_to_hex(replica: ReplicaId) -> String {
    format!("{:016x}", replica.get())
}

fn json_to_value(json: serde_json::Value) -> Result<Value, String> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or("number out of range")?),
        },
        serde_json::Value::String(s) => Value::String(s),
        other => return Err(format!("unsupported value {other}")),
    })
}

#[wasm_bindgen]
pub struct WasmDoc {
    inner: Document,
}

#[wasm_bindgen]
impl WasmDoc {
    #[wasm_bindgen(constructor)]
    pub fn new(replica: u64) -> WasmDoc {
        WasmDoc {
            inner: Document::new(ReplicaId::new(replica)),
        }
    }

    #[wasm_bindgen(js_name = applyUpdate)]
    pub fn apply_update(&mut self, update: Vec<u8>) -> Result<(), JsValue> {
        self.inner.apply_update(&update).map_err(to_js_err)
    }

    #[wasm_bindgen(js_name = applyUpdateV2)]
    pub fn apply_update_v2(&mut self, update: Vec<u8>) -> Result<(), JsValue> {
        self.inner.apply_update_v2(&update).map_err(to_js_err)
    }

    /// Diff against an encoded state vector, or the whole document when none is given.
    #[wasm_bindgen(js_name = encodeStateAsUpdate)]
    pub fn encode_state_as_update(
        &self,
        state_vector: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, JsValue> {
        let known = state_vector
            .as_deref()
            .map(decode_state_vector)
            .transpose()
            .map_err(to_js_err)?;
        Ok(self.inner.encode_state_as_update(known.as_ref()))
    }

    #[wasm_bindgen(js_name = encodeStateAsUpdateV2)]
    pub fn encode_state_as_update_v2(
        &self,
        state_vector: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, JsValue> {
        let known = state_vector
            .as_deref()
            .map(decode_state_vector)
            .transpose()
            .map_err(to_js_err)?;
        Ok(self.inner.encode_state_as_update_v2(known.as_ref()))
    }

    #[wasm_bindgen(js_name = stateVector)]
    pub fn state_vector(&self) -> Vec<u8> {
        self.inner.encode_state_vector()
    }

    #[wasm_bindgen(js_name = insertText)]
    pub fn insert_text(&mut self, root: String, index: u32, text: String) -> Result<(), JsValue> {
        let branch = BranchRef::root(&root);
        self.inner
            .transact(|txn| txn.insert_text(&branch, index, &text))
            .map(|_| ())
            .map_err(to_js_err)
    }

    #[wasm_bindgen(js_name = removeRange)]
    pub fn remove_range(&mut self, root: String, index: u32, len: u32) -> Result<(), JsValue> {
        let branch = BranchRef::root(&root);
        self.inner
            .transact(|txn| txn.remove_range(&branch, index, len))
            .map_err(to_js_err)
    }

    /// Set `key` of a root map to a JSON scalar.
    #[wasm_bindgen(js_name = mapSet)]
    pub fn map_set(
        &mut self,
        root: String,
        key: String,
        value_json: String,
    ) -> Result<(), JsValue> {
        let json: serde_json::Value = serde_json::from_str(&value_json).map_err(to_js_err)?;
        let value = json_to_value(json).map_err(|e| JsValue::from_str(&e))?;
        let branch = BranchRef::root(&root);
        self.inner
            .transact(|txn| txn.map_set(&branch, &key, value))
            .map(|_| ())
            .map_err(to_js_err)
    }

    pub fn text(&self, root: String) -> String {
        self.inner.text(&root)
    }

    pub fn snapshot(&self) -> Result<JsValue, JsValue> {
        to_value(&self.inner.snapshot()).map_err(to_js_err)
    }

    /// Clocks still missing before buffered updates can integrate, or `null`.
    #[wasm_bindgen(js_name = pendingMissing)]
    pub fn pending_missing(&self) -> Result<JsValue, JsValue> {
        let missing: Option<Vec<(String, u32)>> = self.inner.pending_missing().map(|sv| {
            sv.iter()
                .map(|(replica, clock)| (replica_to_hex(replica), clock))
                .collect()
        });
        to_value(&missing).map_err(to_js_err)
    }

    #[wasm_bindgen(js_name = blockDump)]
    pub fn block_dump(&self) -> Result<JsValue, JsValue> {
        #[derive(Serialize)]
        struct DumpRow {
            replica: String,
            clock: u32,
            len: u32,
            kind: &'static str,
            deleted: bool,
        }

        let store = self.inner.store();
        let mut rows: Vec<DumpRow> = Vec::with_capacity(store.block_count());
        for replica in store.replicas() {
            for block in store.blocks(replica) {
                let kind = match block {
                    Block::Gc(_) => "gc",
                    Block::Item(item) => match item.content {
                        Content::String(_) => "string",
                        Content::Values(_) => "values",
                        Content::Branch => "branch",
                        Content::Deleted(_) => "deleted",
                    },
                };
                rows.push(DumpRow {
                    replica: replica_to_hex(replica),
                    clock: block.id().clock,
                    len: block.len(),
                    kind,
                    deleted: block.is_deleted(),
                });
            }
        }
        to_value(&rows).map_err(to_js_err)
    }
}
