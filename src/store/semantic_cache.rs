use super::AccountStore;
use crate::error::{AppError, AppResult};
use rusqlite::{params, OptionalExtension};
use sha2::Digest;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: String,
    pub prompt_text: String,
    pub embedding: Vec<f32>,
    pub response_text: String,
    pub model: String,
    pub created_at: i64,
}

impl CacheEntry {
    pub fn new(prompt_text: String, embedding: Vec<f32>, response_text: String, model: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt_text,
            embedding,
            response_text,
            model,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

pub fn prompt_hash(prompt: &str) -> String {
    let digest = sha2::Sha256::digest(prompt.trim().as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(v.len() * 4);
    for f in v {
        blob.extend_from_slice(&f.to_le_bytes());
    }
    blob
}

fn blob_to_vec(blob: &[u8]) -> AppResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(AppError::Protocol("embedding blob has a ragged length".to_string()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

impl AccountStore {
    /// Direct hash lookup; always preempts the similarity scan.
    pub fn cache_find_exact(&self, prompt: &str) -> AppResult<Option<String>> {
        let hash = prompt_hash(prompt);
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let hit: Option<String> = conn
            .query_row(
                "SELECT response_text FROM semantic_cache WHERE prompt_hash = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit)
    }

    /// Full scan over stored vectors; first row meeting the threshold wins.
    /// Vectors are stored unit-normalised, so the dot product is the cosine.
    pub fn cache_find_semantic(&self, query: &[f32], threshold: f32) -> AppResult<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt =
            conn.prepare("SELECT embedding, response_text FROM semantic_cache ORDER BY created_at")?;
        let rows: Vec<(Vec<u8>, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        for (blob, response) in rows {
            let stored = blob_to_vec(&blob)?;
            if stored.len() != query.len() {
                continue;
            }
            if dot(&stored, query) >= threshold {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    pub fn cache_save(&self, entry: &CacheEntry) -> AppResult<()> {
        let hash = prompt_hash(&entry.prompt_text);
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO semantic_cache (id, prompt_hash, prompt_text, embedding,
                                         response_text, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id, prompt_hash) DO UPDATE SET
                 response_text = excluded.response_text,
                 model = excluded.model,
                 created_at = excluded.created_at",
            params![
                entry.id,
                hash,
                entry.prompt_text,
                vec_to_blob(&entry.embedding),
                entry.response_text,
                entry.model,
                entry.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn cache_purge(&self) -> AppResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.execute("DELETE FROM semantic_cache", [])?)
    }
}
