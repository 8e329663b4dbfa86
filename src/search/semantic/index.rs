//! Approximate nearest-neighbor indexes
//!
//! The semantic tier stores L2-normalized embeddings, so similarity is a
//! dot product and "distance" below means `1 - dot`. Four index variants
//! cover the corpus-size spectrum:
//!
//! - `Flat`: exhaustive scan, exact. Small corpora.
//! - `IvfFlat`: k-means coarse partitioning, scan `nprobe` cells.
//! - `IvfPq`: coarse partitioning plus product-quantized codes with a
//!   full-precision rescore of the shortlist.
//! - `Hnsw`: layered small-world graph (M=32, efConstruction=200,
//!   efSearch=64).
//!
//! Vectors themselves live in [`Vectors`], either full f32 or INT8 with a
//! per-row scale (~75% memory reduction, negligible recall loss at these
//! dimensions).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::super::{Result, SearchError};

/// Seed for every stochastic choice during index construction, so builds
/// are reproducible across runs and platforms.
const BUILD_SEED: u64 = 0x5EED_CAFE;

/// Vocabulary size at or above which vectors are stored INT8-quantized.
pub const QUANTIZE_MIN_ROWS: usize = 100;

/// Index variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// Exhaustive exact scan
    Flat,
    /// Inverted-file partitioning with full vectors
    IvfFlat,
    /// Inverted-file partitioning with product-quantized codes
    IvfPq,
    /// Hierarchical navigable small-world graph
    Hnsw,
}

/// Pick an index variant by corpus size.
pub fn choose_index_type(rows: usize) -> IndexType {
    if rows <= 5_000 {
        IndexType::Flat
    } else if rows <= 15_000 {
        IndexType::IvfFlat
    } else if rows <= 40_000 {
        IndexType::IvfPq
    } else if rows <= 150_000 {
        IndexType::Hnsw
    } else {
        // Memory-optimal end of the table; rotation pretraining is folded
        // into plain PQ here.
        IndexType::IvfPq
    }
}

/// Embedding storage: full precision or INT8 with a per-row scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Vectors {
    /// Full f32 rows, row-major
    F32 {
        /// Vector dimension
        dim: usize,
        /// Row-major payload, `rows * dim` long
        data: Vec<f32>,
    },
    /// INT8 rows with one dequantization scale per row
    Int8 {
        /// Vector dimension
        dim: usize,
        /// Row-major codes, `rows * dim` long
        data: Vec<i8>,
        /// Per-row scale (`value = code * scale`)
        scales: Vec<f32>,
    },
}

impl Vectors {
    /// Pack embedding rows, quantizing when the corpus is large enough.
    pub fn from_rows(rows: &[Vec<f32>], dim: usize) -> Self {
        if rows.len() >= QUANTIZE_MIN_ROWS {
            let mut data = Vec::with_capacity(rows.len() * dim);
            let mut scales = Vec::with_capacity(rows.len());
            for row in rows {
                let max_abs = row.iter().fold(0.0f32, |m, x| m.max(x.abs()));
                let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
                scales.push(scale);
                data.extend(row.iter().map(|x| (x / scale).round() as i8));
            }
            Vectors::Int8 { dim, data, scales }
        } else {
            let mut data = Vec::with_capacity(rows.len() * dim);
            for row in rows {
                data.extend_from_slice(row);
            }
            Vectors::F32 { dim, data }
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Vectors::F32 { dim, data } => {
                if *dim == 0 {
                    0
                } else {
                    data.len() / dim
                }
            }
            Vectors::Int8 { scales, .. } => scales.len(),
        }
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        match self {
            Vectors::F32 { dim, .. } | Vectors::Int8 { dim, .. } => *dim,
        }
    }

    /// Dot product between a stored row and a query vector.
    pub fn dot(&self, row: usize, query: &[f32]) -> f32 {
        match self {
            Vectors::F32 { dim, data } => {
                let start = row * dim;
                data[start..start + dim]
                    .iter()
                    .zip(query)
                    .map(|(x, q)| x * q)
                    .sum()
            }
            Vectors::Int8 { dim, data, scales } => {
                let start = row * dim;
                let raw: f32 = data[start..start + dim]
                    .iter()
                    .zip(query)
                    .map(|(&c, q)| c as f32 * q)
                    .sum();
                raw * scales[row]
            }
        }
    }

    /// A dequantized copy of one row.
    pub fn row(&self, row: usize) -> Vec<f32> {
        match self {
            Vectors::F32 { dim, data } => data[row * dim..(row + 1) * dim].to_vec(),
            Vectors::Int8 { dim, data, scales } => data[row * dim..(row + 1) * dim]
                .iter()
                .map(|&c| c as f32 * scales[row])
                .collect(),
        }
    }
}

/// An ANN index over a [`Vectors`] store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnnIndex {
    /// Exhaustive scan (no auxiliary structure)
    Flat,
    /// IVF with full-precision scoring
    IvfFlat(IvfFlatIndex),
    /// IVF with PQ codes and full-precision rescore
    IvfPq(IvfPqIndex),
    /// HNSW graph
    Hnsw(HnswIndex),
}

impl AnnIndex {
    /// Build an index of the requested variant.
    pub fn build(
        vectors: &Vectors,
        index_type: IndexType,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        if vectors.is_empty() {
            return Err(SearchError::Semantic(
                "cannot build an index over zero embeddings".to_string(),
            ));
        }
        match index_type {
            IndexType::Flat => Ok(AnnIndex::Flat),
            IndexType::IvfFlat => Ok(AnnIndex::IvfFlat(IvfFlatIndex::build(vectors, cancel)?)),
            IndexType::IvfPq => Ok(AnnIndex::IvfPq(IvfPqIndex::build(vectors, cancel)?)),
            IndexType::Hnsw => Ok(AnnIndex::Hnsw(HnswIndex::build(vectors, cancel)?)),
        }
    }

    /// Top-`k` rows by similarity (dot product), descending.
    pub fn search(&self, vectors: &Vectors, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        match self {
            AnnIndex::Flat => flat_search(vectors, query, k),
            AnnIndex::IvfFlat(index) => index.search(vectors, query, k),
            AnnIndex::IvfPq(index) => index.search(vectors, query, k),
            AnnIndex::Hnsw(index) => index.search(vectors, query, k),
        }
    }

    /// Which variant this is.
    pub fn index_type(&self) -> IndexType {
        match self {
            AnnIndex::Flat => IndexType::Flat,
            AnnIndex::IvfFlat(_) => IndexType::IvfFlat,
            AnnIndex::IvfPq(_) => IndexType::IvfPq,
            AnnIndex::Hnsw(_) => IndexType::Hnsw,
        }
    }
}

fn flat_search(vectors: &Vectors, query: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = (0..vectors.len())
        .map(|row| (row, vectors.dot(row, query)))
        .collect();
    top_k(&mut scored, k);
    scored
}

/// Sort by score descending (row index breaks ties) and truncate.
fn top_k(scored: &mut Vec<(usize, f32)>, k: usize) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<()> {
    if cancel.is_some_and(|t| t.is_cancelled()) {
        return Err(SearchError::Cancelled);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// k-means (shared by IVF coarse quantizers and PQ codebooks)
// ---------------------------------------------------------------------------

/// Lloyd's k-means over row-major data. Returns `k * dim` centroids.
fn kmeans(
    data: &[f32],
    dim: usize,
    k: usize,
    iterations: usize,
    rng: &mut StdRng,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<f32>> {
    let rows = data.len() / dim;
    let k = k.min(rows).max(1);

    // Initialize from distinct random rows
    let mut centroids = Vec::with_capacity(k * dim);
    let mut chosen = std::collections::HashSet::new();
    while chosen.len() < k {
        let row = rng.gen_range(0..rows);
        if chosen.insert(row) {
            centroids.extend_from_slice(&data[row * dim..(row + 1) * dim]);
        }
    }

    let mut assignment = vec![0usize; rows];
    for _ in 0..iterations {
        check_cancel(cancel)?;

        for row in 0..rows {
            assignment[row] = nearest_centroid(&data[row * dim..(row + 1) * dim], &centroids, dim);
        }

        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0usize; k];
        for row in 0..rows {
            let c = assignment[row];
            counts[c] += 1;
            for d in 0..dim {
                sums[c * dim + d] += data[row * dim + d];
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed empty cells from a random row
                let row = rng.gen_range(0..rows);
                sums[c * dim..(c + 1) * dim]
                    .copy_from_slice(&data[row * dim..(row + 1) * dim]);
                counts[c] = 1;
            }
            for d in 0..dim {
                centroids[c * dim + d] = sums[c * dim + d] / counts[c] as f32;
            }
        }
    }
    Ok(centroids)
}

fn nearest_centroid(vector: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let dist: f32 = vector
            .iter()
            .zip(centroid)
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

fn rank_centroids(query: &[f32], centroids: &[f32], dim: usize, nprobe: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = centroids
        .chunks_exact(dim)
        .enumerate()
        .map(|(c, centroid)| {
            let dist: f32 = query
                .iter()
                .zip(centroid)
                .map(|(x, y)| (x - y) * (x - y))
                .sum();
            (c, dist)
        })
        .collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    scored.into_iter().take(nprobe).map(|(c, _)| c).collect()
}

// ---------------------------------------------------------------------------
// IVF-Flat
// ---------------------------------------------------------------------------

/// Inverted-file index scoring full-precision vectors in probed cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfFlatIndex {
    nlist: usize,
    nprobe: usize,
    dim: usize,
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
}

impl IvfFlatIndex {
    fn build(vectors: &Vectors, cancel: Option<&CancellationToken>) -> Result<Self> {
        let rows = vectors.len();
        let dim = vectors.dim();
        let nlist = ((rows as f64).sqrt() as usize).clamp(1, 1024);
        let nprobe = (nlist / 4).max(1);

        let data: Vec<f32> = (0..rows).flat_map(|r| vectors.row(r)).collect();
        let mut rng = StdRng::seed_from_u64(BUILD_SEED);
        let centroids = kmeans(&data, dim, nlist, 8, &mut rng, cancel)?;
        let nlist = centroids.len() / dim;

        let mut lists = vec![Vec::new(); nlist];
        for row in 0..rows {
            let c = nearest_centroid(&data[row * dim..(row + 1) * dim], &centroids, dim);
            lists[c].push(row as u32);
        }

        Ok(Self {
            nlist,
            nprobe,
            dim,
            centroids,
            lists,
        })
    }

    fn search(&self, vectors: &Vectors, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut scored = Vec::new();
        for cell in rank_centroids(query, &self.centroids, self.dim, self.nprobe) {
            for &row in &self.lists[cell] {
                scored.push((row as usize, vectors.dot(row as usize, query)));
            }
        }
        top_k(&mut scored, k);
        scored
    }
}

// ---------------------------------------------------------------------------
// IVF-PQ
// ---------------------------------------------------------------------------

/// Product-quantization codebook: `m` subspaces, up to 256 centroids each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqCodebook {
    m: usize,
    ks: usize,
    sub_dim: usize,
    /// `m * ks * sub_dim` centroid payload
    centroids: Vec<f32>,
}

impl PqCodebook {
    fn train(
        data: &[f32],
        dim: usize,
        rows: usize,
        rng: &mut StdRng,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self> {
        let m = [8usize, 4, 2, 1]
            .into_iter()
            .find(|m| dim % m == 0)
            .expect("1 always divides dim");
        let sub_dim = dim / m;
        let ks = 256.min(rows.max(2));

        let mut centroids = Vec::with_capacity(m * ks * sub_dim);
        for sub in 0..m {
            check_cancel(cancel)?;
            let sub_data: Vec<f32> = (0..rows)
                .flat_map(|r| {
                    data[r * dim + sub * sub_dim..r * dim + (sub + 1) * sub_dim].to_vec()
                })
                .collect();
            let sub_centroids = kmeans(&sub_data, sub_dim, ks, 6, rng, cancel)?;
            // kmeans may return fewer centroids than requested; pad by repeating
            let got = sub_centroids.len() / sub_dim;
            centroids.extend_from_slice(&sub_centroids);
            for pad in got..ks {
                let src = (pad % got) * sub_dim;
                let repeated = sub_centroids[src..src + sub_dim].to_vec();
                centroids.extend_from_slice(&repeated);
            }
        }

        Ok(Self {
            m,
            ks,
            sub_dim,
            centroids,
        })
    }

    fn encode(&self, vector: &[f32]) -> Vec<u8> {
        (0..self.m)
            .map(|sub| {
                let slice = &vector[sub * self.sub_dim..(sub + 1) * self.sub_dim];
                let base = sub * self.ks * self.sub_dim;
                let table = &self.centroids[base..base + self.ks * self.sub_dim];
                nearest_centroid(slice, table, self.sub_dim) as u8
            })
            .collect()
    }

    /// Per-subspace dot-product tables for a query (asymmetric distance).
    fn dot_tables(&self, query: &[f32]) -> Vec<f32> {
        let mut tables = vec![0.0f32; self.m * self.ks];
        for sub in 0..self.m {
            let q = &query[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            for code in 0..self.ks {
                let base = (sub * self.ks + code) * self.sub_dim;
                tables[sub * self.ks + code] = self.centroids[base..base + self.sub_dim]
                    .iter()
                    .zip(q)
                    .map(|(c, q)| c * q)
                    .sum();
            }
        }
        tables
    }
}

/// IVF partitioning over PQ codes, with a full-precision rescore of the
/// shortlist so quantization error never decides the final ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfPqIndex {
    nlist: usize,
    nprobe: usize,
    dim: usize,
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
    pq: PqCodebook,
    /// `rows * m` code payload
    codes: Vec<u8>,
}

impl IvfPqIndex {
    fn build(vectors: &Vectors, cancel: Option<&CancellationToken>) -> Result<Self> {
        let rows = vectors.len();
        let dim = vectors.dim();
        let nlist = ((rows as f64).sqrt() as usize).clamp(1, 2048);
        let nprobe = (nlist / 4).max(1);

        let data: Vec<f32> = (0..rows).flat_map(|r| vectors.row(r)).collect();
        let mut rng = StdRng::seed_from_u64(BUILD_SEED);
        let centroids = kmeans(&data, dim, nlist, 8, &mut rng, cancel)?;
        let nlist = centroids.len() / dim;

        let mut lists = vec![Vec::new(); nlist];
        for row in 0..rows {
            let c = nearest_centroid(&data[row * dim..(row + 1) * dim], &centroids, dim);
            lists[c].push(row as u32);
        }

        let pq = PqCodebook::train(&data, dim, rows, &mut rng, cancel)?;
        let mut codes = Vec::with_capacity(rows * pq.m);
        for row in 0..rows {
            check_cancel(cancel)?;
            codes.extend(pq.encode(&data[row * dim..(row + 1) * dim]));
        }

        Ok(Self {
            nlist,
            nprobe,
            dim,
            centroids,
            lists,
            pq,
            codes,
        })
    }

    fn search(&self, vectors: &Vectors, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let tables = self.pq.dot_tables(query);
        let mut approx = Vec::new();
        for cell in rank_centroids(query, &self.centroids, self.dim, self.nprobe) {
            for &row in &self.lists[cell] {
                let code = &self.codes[row as usize * self.pq.m..(row as usize + 1) * self.pq.m];
                let score: f32 = code
                    .iter()
                    .enumerate()
                    .map(|(sub, &c)| tables[sub * self.pq.ks + c as usize])
                    .sum();
                approx.push((row as usize, score));
            }
        }

        // Shortlist by approximate score, rescore exactly
        top_k(&mut approx, (k * 4).max(32));
        let mut rescored: Vec<(usize, f32)> = approx
            .into_iter()
            .map(|(row, _)| (row, vectors.dot(row, query)))
            .collect();
        top_k(&mut rescored, k);
        rescored
    }
}

// ---------------------------------------------------------------------------
// HNSW
// ---------------------------------------------------------------------------

const HNSW_M: usize = 32;
const HNSW_EF_CONSTRUCTION: usize = 200;
const HNSW_EF_SEARCH: usize = 64;

#[derive(PartialEq)]
struct Near(f32, u32);

impl Eq for Near {}
impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Near {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap by distance: peek() is the farthest kept candidate
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Hierarchical navigable small-world graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    m: usize,
    ef_search: usize,
    entry: u32,
    max_level: usize,
    /// `neighbors[node][level]` = adjacency list
    neighbors: Vec<Vec<Vec<u32>>>,
}

impl HnswIndex {
    fn build(vectors: &Vectors, cancel: Option<&CancellationToken>) -> Result<Self> {
        let rows = vectors.len();
        let mut rng = StdRng::seed_from_u64(BUILD_SEED);
        let level_mult = 1.0 / (HNSW_M as f64).ln();

        let mut index = Self {
            m: HNSW_M,
            ef_search: HNSW_EF_SEARCH,
            entry: 0,
            max_level: 0,
            neighbors: Vec::with_capacity(rows),
        };

        for node in 0..rows as u32 {
            if node % 256 == 0 {
                check_cancel(cancel)?;
            }
            let level = (-rng.gen::<f64>().ln() * level_mult).floor() as usize;
            index.insert(vectors, node, level);
        }
        Ok(index)
    }

    fn insert(&mut self, vectors: &Vectors, node: u32, level: usize) {
        self.neighbors.push(vec![Vec::new(); level + 1]);
        if node == 0 {
            self.entry = 0;
            self.max_level = level;
            return;
        }

        let query = vectors.row(node as usize);
        let mut current = self.entry;

        // Greedy descent through levels above the new node's level
        for l in (level + 1..=self.max_level).rev() {
            current = self.greedy_step(vectors, &query, current, l);
        }

        // Connect on every level the node participates in
        for l in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(vectors, &query, current, l, HNSW_EF_CONSTRUCTION);
            let max_links = if l == 0 { self.m * 2 } else { self.m };
            let selected: Vec<u32> = found.iter().take(max_links).map(|&(id, _)| id).collect();

            for &peer in &selected {
                self.neighbors[node as usize][l].push(peer);
                self.neighbors[peer as usize][l].push(node);
                // Trim overgrown peers to their link budget, keeping the closest
                if self.neighbors[peer as usize][l].len() > max_links {
                    let peer_vec = vectors.row(peer as usize);
                    let mut links = std::mem::take(&mut self.neighbors[peer as usize][l]);
                    links.sort_by(|&a, &b| {
                        let da = 1.0 - vectors.dot(a as usize, &peer_vec);
                        let db = 1.0 - vectors.dot(b as usize, &peer_vec);
                        da.partial_cmp(&db).unwrap_or(Ordering::Equal)
                    });
                    links.truncate(max_links);
                    self.neighbors[peer as usize][l] = links;
                }
            }
            if let Some(&(nearest, _)) = found.first() {
                current = nearest;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = node;
        }
    }

    fn greedy_step(&self, vectors: &Vectors, query: &[f32], start: u32, level: usize) -> u32 {
        let mut current = start;
        let mut current_dist = 1.0 - vectors.dot(current as usize, query);
        loop {
            let mut improved = false;
            if let Some(links) = self.neighbors[current as usize].get(level) {
                for &peer in links {
                    let dist = 1.0 - vectors.dot(peer as usize, query);
                    if dist < current_dist {
                        current = peer;
                        current_dist = dist;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one level. Returns `(node, distance)` pairs sorted by
    /// distance ascending.
    fn search_layer(
        &self,
        vectors: &Vectors,
        query: &[f32],
        entry: u32,
        level: usize,
        ef: usize,
    ) -> Vec<(u32, f32)> {
        let entry_dist = 1.0 - vectors.dot(entry as usize, query);
        let mut visited: std::collections::HashSet<u32> = std::collections::HashSet::new();
        visited.insert(entry);

        // candidates: nearest-first (min-heap via negated distance)
        let mut candidates = BinaryHeap::new();
        candidates.push(Near(-entry_dist, entry));
        // results: farthest-first so the worst survivor is peekable
        let mut results = BinaryHeap::new();
        results.push(Near(entry_dist, entry));

        while let Some(Near(neg_dist, node)) = candidates.pop() {
            let dist = -neg_dist;
            let worst = results.peek().map(|n| n.0).unwrap_or(f32::INFINITY);
            if dist > worst && results.len() >= ef {
                break;
            }
            if let Some(links) = self.neighbors[node as usize].get(level) {
                for &peer in links {
                    if !visited.insert(peer) {
                        continue;
                    }
                    let peer_dist = 1.0 - vectors.dot(peer as usize, query);
                    let worst = results.peek().map(|n| n.0).unwrap_or(f32::INFINITY);
                    if results.len() < ef || peer_dist < worst {
                        candidates.push(Near(-peer_dist, peer));
                        results.push(Near(peer_dist, peer));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results.into_iter().map(|Near(d, id)| (id, d)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    fn search(&self, vectors: &Vectors, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if self.neighbors.is_empty() {
            return Vec::new();
        }
        let mut current = self.entry;
        for level in (1..=self.max_level).rev() {
            current = self.greedy_step(vectors, query, current, level);
        }
        let found = self.search_layer(vectors, query, current, 0, self.ef_search.max(k));
        let mut scored: Vec<(usize, f32)> = found
            .into_iter()
            .map(|(id, _)| (id as usize, vectors.dot(id as usize, query)))
            .collect();
        top_k(&mut scored, k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::semantic::embedder::normalize;

    /// Deterministic pseudo-random normalized vectors.
    fn sample_vectors(rows: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(42);
        (0..rows)
            .map(|_| {
                let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                normalize(&mut v);
                v
            })
            .collect()
    }

    #[test]
    fn test_vectors_int8_round_trip_is_close() {
        let rows = sample_vectors(QUANTIZE_MIN_ROWS, 32);
        let store = Vectors::from_rows(&rows, 32);
        assert!(matches!(store, Vectors::Int8 { .. }));

        for (i, original) in rows.iter().enumerate() {
            let restored = store.row(i);
            let err: f32 = original
                .iter()
                .zip(&restored)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max);
            assert!(err < 0.02, "row {i} quantization error {err}");
        }
    }

    #[test]
    fn test_small_store_stays_f32() {
        let rows = sample_vectors(10, 16);
        let store = Vectors::from_rows(&rows, 16);
        assert!(matches!(store, Vectors::F32 { .. }));
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_index_type_selection() {
        assert_eq!(choose_index_type(100), IndexType::Flat);
        assert_eq!(choose_index_type(10_000), IndexType::IvfFlat);
        assert_eq!(choose_index_type(30_000), IndexType::IvfPq);
        assert_eq!(choose_index_type(100_000), IndexType::Hnsw);
        assert_eq!(choose_index_type(200_000), IndexType::IvfPq);
    }

    #[test]
    fn test_flat_search_finds_self() {
        let rows = sample_vectors(50, 16);
        let store = Vectors::from_rows(&rows, 16);
        let index = AnnIndex::build(&store, IndexType::Flat, None).unwrap();

        let hits = index.search(&store, &rows[7], 1);
        assert_eq!(hits[0].0, 7);
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn test_ivf_flat_recall_on_self_queries() {
        let rows = sample_vectors(500, 16);
        let store = Vectors::from_rows(&rows, 16);
        let index = AnnIndex::build(&store, IndexType::IvfFlat, None).unwrap();

        let mut found = 0;
        for (i, row) in rows.iter().enumerate().step_by(10) {
            let hits = index.search(&store, row, 5);
            if hits.iter().any(|&(id, _)| id == i) {
                found += 1;
            }
        }
        // Self-queries land in their own cell; recall should be near total
        assert!(found >= 45, "ivf recall too low: {found}/50");
    }

    #[test]
    fn test_hnsw_recall_on_self_queries() {
        let rows = sample_vectors(400, 16);
        let store = Vectors::from_rows(&rows, 16);
        let index = AnnIndex::build(&store, IndexType::Hnsw, None).unwrap();

        let mut found = 0;
        for (i, row) in rows.iter().enumerate().step_by(10) {
            let hits = index.search(&store, row, 5);
            if hits.iter().any(|&(id, _)| id == i) {
                found += 1;
            }
        }
        assert!(found >= 36, "hnsw recall too low: {found}/40");
    }

    #[test]
    fn test_ivfpq_rescore_returns_reasonable_neighbors() {
        let rows = sample_vectors(300, 16);
        let store = Vectors::from_rows(&rows, 16);
        let index = AnnIndex::build(&store, IndexType::IvfPq, None).unwrap();

        let mut found = 0;
        for (i, row) in rows.iter().enumerate().step_by(10) {
            let hits = index.search(&store, row, 5);
            if hits.iter().any(|&(id, _)| id == i) {
                found += 1;
            }
        }
        assert!(found >= 20, "ivfpq recall too low: {found}/30");
    }

    #[test]
    fn test_empty_build_is_rejected() {
        let store = Vectors::from_rows(&[], 16);
        assert!(AnnIndex::build(&store, IndexType::Flat, None).is_err());
    }

    #[test]
    fn test_build_honors_cancellation() {
        let rows = sample_vectors(300, 16);
        let store = Vectors::from_rows(&rows, 16);
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            AnnIndex::build(&store, IndexType::Hnsw, Some(&token)),
            Err(SearchError::Cancelled)
        ));
    }

    #[test]
    fn test_index_serialization_round_trip() {
        let rows = sample_vectors(200, 16);
        let store = Vectors::from_rows(&rows, 16);
        let index = AnnIndex::build(&store, IndexType::IvfFlat, None).unwrap();

        let bytes = bincode::serialize(&index).unwrap();
        let restored: AnnIndex = bincode::deserialize(&bytes).unwrap();

        let a = index.search(&store, &rows[3], 5);
        let b = restored.search(&store, &rows[3], 5);
        assert_eq!(a, b);
    }
}
