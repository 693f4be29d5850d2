use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{LmmError, Result};
use crate::model::ReTerm;

use super::block::Storage;
use super::sparse::{columns_have_single_entry, level_incidence};

/// Cross-term blocks denser than this are stored dense from the start.
pub const DENSE_THRESHOLD: f64 = 0.5;

/// Exhaustive order search is used up to this many terms.
const MAX_SEARCH_TERMS: usize = 5;

const F64_BYTES: usize = std::mem::size_of::<f64>();
const INDEX_BYTES: usize = std::mem::size_of::<usize>();

/// Position of block (i, j), i >= j, in a packed lower triangle.
pub fn tri(i: usize, j: usize) -> usize {
    debug_assert!(j <= i);
    i * (i + 1) / 2 + j
}

/// Levels and random effects per level of one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermShape {
    pub n_levels: usize,
    pub q: usize,
}

impl TermShape {
    fn size(&self) -> usize {
        self.n_levels * self.q
    }
}

/// Level co-occurrence of two terms, indexed by original term position.
#[derive(Debug, Clone, Copy)]
struct PairPattern {
    nnz: usize,
    /// Each level of the second term meets at most one level of the first.
    second_nested_in_first: bool,
    /// Each level of the first term meets at most one level of the second.
    first_nested_in_second: bool,
}

/// One line of the fill-in report.
#[derive(Debug, Clone, Serialize)]
pub struct BlockReport {
    pub row: String,
    pub col: String,
    pub storage: Storage,
    pub shape: (usize, usize),
    pub bytes: usize,
}

/// Storage chosen for every factor block and the memory it takes.
#[derive(Debug, Clone, Serialize)]
pub struct FillInReport {
    pub order: Vec<String>,
    pub blocks: Vec<BlockReport>,
    pub total_bytes: usize,
}

impl fmt::Display for FillInReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Elimination order: {}", self.order.join(", "))?;
        writeln!(
            f,
            "{:<14} {:<14} {:<14} {:>14} {:>12}",
            "Row", "Column", "Storage", "Shape", "Bytes"
        )?;
        for b in &self.blocks {
            writeln!(
                f,
                "{:<14} {:<14} {:<14} {:>14} {:>12}",
                b.row,
                b.col,
                format!("{:?}", b.storage),
                format!("{}x{}", b.shape.0, b.shape.1),
                b.bytes
            )?;
        }
        write!(f, "Total: {} bytes", self.total_bytes)
    }
}

/// Symbolic elimination of the blocked system at level granularity.
///
/// Decides the elimination order of the random-effects terms and the
/// storage of every raw and factor block once, before any numeric work.
/// All block vectors are packed lower triangles in elimination order
/// (see [`tri`]).
#[derive(Debug, Clone)]
pub struct FillInPlan {
    order: Vec<usize>,
    shapes: Vec<TermShape>,
    p1: usize,
    raw: Vec<Storage>,
    factor: Vec<Storage>,
    nonempty: Vec<bool>,
    report: FillInReport,
}

impl FillInPlan {
    /// Analyze `terms` (in model order) and pick the order with the least
    /// fill-in. `p1` is the number of columns of `[X y]`.
    pub fn analyze(terms: &[ReTerm], p1: usize) -> Result<Self> {
        let base = size_order(terms);
        let patterns = pair_patterns(terms);
        let candidates = if terms.len() <= MAX_SEARCH_TERMS {
            permutations(&base)
        } else {
            vec![base]
        };
        let mut best: Option<Self> = None;
        for order in candidates {
            let plan = Self::build(terms, &patterns, order, p1)?;
            let better = best
                .as_ref()
                .map_or(true, |b| plan.report.total_bytes < b.report.total_bytes);
            if better {
                best = Some(plan);
            }
        }
        let plan = best.ok_or_else(|| {
            LmmError::ModelSpec("model has no random-effects terms".into())
        })?;
        log::debug!(
            "fill-in plan: order {:?}, {} bytes",
            plan.report.order,
            plan.report.total_bytes
        );
        Ok(plan)
    }

    /// Plan for a caller-chosen elimination order.
    pub fn with_order(terms: &[ReTerm], order: Vec<usize>, p1: usize) -> Result<Self> {
        let mut sorted = order.clone();
        sorted.sort_unstable();
        if sorted != (0..terms.len()).collect::<Vec<_>>() {
            return Err(LmmError::ModelSpec(format!(
                "{:?} is not an ordering of {} terms",
                order,
                terms.len()
            )));
        }
        Self::build(terms, &pair_patterns(terms), order, p1)
    }

    fn build(
        terms: &[ReTerm],
        patterns: &HashMap<(usize, usize), PairPattern>,
        order: Vec<usize>,
        p1: usize,
    ) -> Result<Self> {
        let k = order.len();
        if k == 0 {
            return Err(LmmError::ModelSpec(
                "model has no random-effects terms".into(),
            ));
        }
        let shapes: Vec<TermShape> = order
            .iter()
            .map(|&t| TermShape {
                n_levels: terms[t].n_levels(),
                q: terms[t].q(),
            })
            .collect();
        // pattern of (row term i, column term j) in elimination positions
        let pattern = |i: usize, j: usize| -> PairPattern {
            let (a, b) = (order[i], order[j]);
            if a > b {
                patterns[&(a, b)]
            } else {
                let p = patterns[&(b, a)];
                PairPattern {
                    nnz: p.nnz,
                    second_nested_in_first: p.first_nested_in_second,
                    first_nested_in_second: p.second_nested_in_first,
                }
            }
        };

        let nblocks = tri(k - 1, k - 1) + 1;
        let mut raw = vec![Storage::Dense; nblocks];
        let mut factor = vec![Storage::Dense; nblocks];
        let mut nonempty = vec![true; nblocks];

        for j in 0..k {
            let diag_raw = if shapes[j].q == 1 {
                Storage::Diagonal
            } else {
                Storage::BlockDiagonal
            };
            raw[tri(j, j)] = diag_raw;
            // an earlier term whose levels each meet a single level of term j
            // only adds to the level-diagonal of L_jj
            let diag_fills = (0..j).any(|c| {
                nonempty[tri(j, c)]
                    && (factor[tri(j, c)] == Storage::Dense
                        || !pattern(j, c).second_nested_in_first)
            });
            factor[tri(j, j)] = if diag_fills { Storage::Dense } else { diag_raw };

            for i in (j + 1)..k {
                let pat = pattern(i, j);
                let cells = shapes[i].n_levels * shapes[j].n_levels;
                let density = if cells == 0 {
                    0.0
                } else {
                    pat.nnz as f64 / cells as f64
                };
                let raw_kind = if density > DENSE_THRESHOLD {
                    Storage::Dense
                } else {
                    Storage::Sparse
                };
                raw[tri(i, j)] = raw_kind;
                let contributions =
                    (0..j).any(|c| nonempty[tri(i, c)] && nonempty[tri(j, c)]);
                let idx = tri(i, j);
                if pat.nnz == 0 && !contributions {
                    factor[idx] = Storage::Sparse;
                    nonempty[idx] = false;
                } else if contributions || factor[tri(j, j)] == Storage::Dense {
                    factor[idx] = Storage::Dense;
                } else {
                    factor[idx] = raw_kind;
                }
            }
        }

        let names: Vec<String> = order.iter().map(|&t| terms[t].name.clone()).collect();
        let report = make_report(&names, &shapes, p1, &factor, |i, j| pattern(i, j).nnz);
        Ok(Self {
            order,
            shapes,
            p1,
            raw,
            factor,
            nonempty,
            report,
        })
    }

    /// Original term indices in elimination order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn n_terms(&self) -> usize {
        self.order.len()
    }

    /// Shape of the term at elimination position `j`.
    pub fn shape(&self, j: usize) -> TermShape {
        self.shapes[j]
    }

    pub fn p1(&self) -> usize {
        self.p1
    }

    pub fn raw_storage(&self, i: usize, j: usize) -> Storage {
        self.raw[tri(i, j)]
    }

    pub fn factor_storage(&self, i: usize, j: usize) -> Storage {
        self.factor[tri(i, j)]
    }

    /// Whether factor block (i, j) can hold non-zeros.
    pub fn is_nonempty(&self, i: usize, j: usize) -> bool {
        self.nonempty[tri(i, j)]
    }

    pub fn report(&self) -> &FillInReport {
        &self.report
    }

    /// Bytes held by one factorization.
    pub fn factor_bytes(&self) -> usize {
        self.report.total_bytes
    }
}

fn size_order(terms: &[ReTerm]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..terms.len()).collect();
    order.sort_by(|&a, &b| terms[b].size().cmp(&terms[a].size()));
    order
}

fn pair_patterns(terms: &[ReTerm]) -> HashMap<(usize, usize), PairPattern> {
    let mut out = HashMap::new();
    for a in 0..terms.len() {
        for b in 0..a {
            let inc = level_incidence(
                &terms[a].refs,
                terms[a].n_levels(),
                &terms[b].refs,
                terms[b].n_levels(),
            );
            let transposed = inc.transpose_view().to_owned();
            out.insert(
                (a, b),
                PairPattern {
                    nnz: inc.nnz(),
                    second_nested_in_first: columns_have_single_entry(&inc),
                    first_nested_in_second: columns_have_single_entry(&transposed),
                },
            );
        }
    }
    out
}

/// All orderings of `base`, starting with `base` itself.
fn permutations(base: &[usize]) -> Vec<Vec<usize>> {
    if base.len() <= 1 {
        return vec![base.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..base.len() {
        let mut rest = base.to_vec();
        let first = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

fn make_report(
    names: &[String],
    shapes: &[TermShape],
    p1: usize,
    factor: &[Storage],
    nnz: impl Fn(usize, usize) -> usize,
) -> FillInReport {
    let k = shapes.len();
    let mut blocks = Vec::new();
    for j in 0..k {
        for i in j..k {
            let storage = factor[tri(i, j)];
            let (si, sj) = (shapes[i], shapes[j]);
            let bytes = match storage {
                Storage::Diagonal => si.n_levels * F64_BYTES,
                Storage::BlockDiagonal => si.n_levels * si.q * si.q * F64_BYTES,
                Storage::Sparse => {
                    let nz = nnz(i, j);
                    nz * si.q * sj.q * F64_BYTES + (sj.n_levels + 1 + nz) * INDEX_BYTES
                }
                Storage::Dense => si.size() * sj.size() * F64_BYTES,
            };
            blocks.push(BlockReport {
                row: names[i].clone(),
                col: names[j].clone(),
                storage,
                shape: (si.size(), sj.size()),
                bytes,
            });
        }
    }
    for j in 0..k {
        blocks.push(BlockReport {
            row: "[X y]".into(),
            col: names[j].clone(),
            storage: Storage::Dense,
            shape: (p1, shapes[j].size()),
            bytes: p1 * shapes[j].size() * F64_BYTES,
        });
    }
    blocks.push(BlockReport {
        row: "[X y]".into(),
        col: "[X y]".into(),
        storage: Storage::Dense,
        shape: (p1, p1),
        bytes: p1 * p1 * F64_BYTES,
    });
    let total_bytes = blocks.iter().map(|b| b.bytes).sum();
    FillInReport {
        order: names.to_vec(),
        blocks,
        total_bytes,
    }
}
