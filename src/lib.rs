/*!
Assign hierarchical cluster codes ("SNP addresses") to samples from a pairwise
[distance matrix](DistanceMatrix) and a descending [threshold schedule](Thresholds).

Each sample receives a dot-separated [`Code`] whose segments name nested
clusters at successively finer thresholds; a sample with no cluster-mates at
any threshold receives the empty code. Samples are inserted one at a time, in
input order, into a [`ClusterForest`] — the result is a deterministic, greedy,
order-dependent assignment, not a globally optimal clustering. If you need
exact hierarchical clusterings, there are
[other crates](https://www.arewelearningyet.com/clustering/) for that.

# Example

```
use snp_codes::{assign_codes, DistanceMatrix, MatrixLayout, SampleKey, Thresholds};

// Lower-left triangular rows; the first row holds only the diagonal.
let matrix = DistanceMatrix::new(
    vec![
        vec![0.0],
        vec![1.0, 0.0],
        vec![5.0, 5.0, 0.0],
        vec![5.0, 5.0, 1.0, 0.0],
    ],
    MatrixLayout::LowerLeft,
);
let samples: Vec<SampleKey> = ["a", "b", "c", "d"]
    .into_iter()
    .enumerate()
    .map(|(row, id)| SampleKey::new(id, row))
    .collect();
// A single threshold of 3; the exact-match level (0) is appended automatically.
let thresholds = Thresholds::new([3.0]).unwrap();

let codes = assign_codes(&samples, &matrix, &thresholds).unwrap();
let rendered: Vec<String> = codes.iter().map(ToString::to_string).collect();

// "a" and "b" share one top-level cluster, "c" and "d" the other.
assert_eq!(rendered, ["1", "1", "2", "2"]);
```
*/

#![expect(
    clippy::missing_errors_doc,
    reason = "The Error-enum is sparse and documented."
)]

use core::fmt;
use log::debug;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;

/// Identifier for one branch of the clustering tree.
///
/// Branch identifiers are small positive integers, allocated from a
/// monotonically increasing per-node counter and never reused, not even after
/// a merge deletes the branches it absorbed.
pub type BranchId = u32;

/// The identifier the first branch under any node receives.
const FIRST_BRANCH: BranchId = 1;

/// A sample identifier together with its cached row index in the distance
/// matrix.
///
/// The row index is cached at load time so that distance lookups never search
/// for the identifier. Identifiers are expected to be unique per run; equality
/// and hashing consider the identifier only.
#[derive(Debug, Clone)]
pub struct SampleKey {
    id: String,
    row: usize,
}

impl SampleKey {
    /// Create a key for the sample `id` stored at matrix row `row`.
    #[inline]
    pub fn new(id: impl Into<String>, row: usize) -> Self {
        Self { id: id.into(), row }
    }

    /// The sample identifier.
    #[must_use]
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The sample's row index in the distance matrix.
    #[must_use]
    #[inline]
    pub const fn row(&self) -> usize {
        self.row
    }
}

impl PartialEq for SampleKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for SampleKey {}
impl core::hash::Hash for SampleKey {
    #[inline]
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for SampleKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Which triangle of a [`DistanceMatrix`] is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixLayout {
    /// Distances live at `rows[i][j]` for `j < i` (bottom-left).
    LowerLeft,
    /// Distances live at `rows[i][j]` for `j > i` (top-right).
    UpperRight,
}

/// A pairwise distance matrix, physically populated on one triangle only.
///
/// Rows may be ragged: a lower-left matrix needs only `j <= i` cells in row
/// `i`. The lookup picks the populated cell regardless of argument order, so
/// the matrix behaves as symmetric. Self-distances are never queried.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    rows: Vec<Vec<f64>>,
    layout: MatrixLayout,
}

impl DistanceMatrix {
    /// Wrap triangular `rows` populated according to `layout`.
    #[must_use]
    #[inline]
    pub const fn new(rows: Vec<Vec<f64>>, layout: MatrixLayout) -> Self {
        Self { rows, layout }
    }

    /// The layout this matrix was created with.
    #[must_use]
    #[inline]
    pub const fn layout(&self) -> MatrixLayout {
        self.layout
    }

    /// The number of rows.
    #[must_use]
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// Look up the distance between two samples, in either argument order.
    ///
    /// Fails with [`Error::OutOfRangeIndex`] if either cached row index has no
    /// populated cell in this matrix.
    #[inline]
    pub fn distance(&self, a: &SampleKey, b: &SampleKey) -> Result<f64, Error> {
        debug_assert!(
            a.row != b.row,
            "Distance lookups should always involve two distinct rows."
        );
        let (lo, hi) = if a.row < b.row {
            (a.row, b.row)
        } else {
            (b.row, a.row)
        };
        let (row, col) = match self.layout {
            MatrixLayout::LowerLeft => (hi, lo),
            MatrixLayout::UpperRight => (lo, hi),
        };
        let cells = self.rows.get(row).ok_or(Error::OutOfRangeIndex {
            index: row,
            len: self.rows.len(),
        })?;
        cells.get(col).copied().ok_or(Error::OutOfRangeIndex {
            index: col,
            len: cells.len(),
        })
    }
}

/// A validated, descending schedule of distance thresholds.
///
/// Level 0 is the coarsest threshold; the last level is the exact-match
/// (distance 0) level, appended automatically when the caller did not supply
/// it. Ties between adjacent thresholds are allowed.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds(Vec<f64>);

impl Thresholds {
    /// Validate `values` and append the exact-match level if absent.
    ///
    /// Rejects empty schedules, negative (or NaN) thresholds, and schedules
    /// that are not sorted in descending order.
    pub fn new(values: impl Into<Vec<f64>>) -> Result<Self, Error> {
        let mut values = values.into();
        if values.is_empty() {
            return Err(Error::EmptyThresholds);
        }
        let mut previous = f64::INFINITY;
        for (position, &value) in values.iter().enumerate() {
            if value.is_nan() || value < 0.0 {
                return Err(Error::NegativeThreshold(value));
            }
            if value > previous {
                return Err(Error::UnsortedThresholds { position });
            }
            previous = value;
        }
        if values.last().copied() != Some(0.0) {
            values.push(0.0);
        }
        Ok(Self(values))
    }

    /// The number of levels, including the exact-match level.
    #[must_use]
    #[inline]
    pub fn levels(&self) -> usize {
        self.0.len()
    }

    /// The index of the exact-match (leaf) level.
    #[must_use]
    #[inline]
    pub fn leaf_level(&self) -> usize {
        self.0.len() - 1
    }

    /// The threshold at `level`. Panics if `level` is out of range.
    #[must_use]
    #[inline]
    pub fn at(&self, level: usize) -> f64 {
        self.0[level]
    }

    /// The full schedule, coarsest first.
    #[must_use]
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// A dot-joined path of branch identifiers naming one cluster.
///
/// The empty code (displayed as `""`) means "no cluster membership at any
/// threshold".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code(SmallVec<[BranchId; 6]>);

impl Code {
    /// Whether this is the empty code.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of path segments.
    #[must_use]
    #[inline]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The code of the child reached through `branch`.
    fn child(&self, branch: BranchId) -> Self {
        let mut path = self.0.clone();
        path.push(branch);
        Self(path)
    }
}

impl fmt::Display for Code {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut segments = self.0.iter();
        if let Some(first) = segments.next() {
            write!(f, "{first}")?;
            for branch in segments {
                write!(f, ".{branch}")?;
            }
        }
        Ok(())
    }
}

/// Everything an insertion or query needs to know beyond the tree itself:
/// the distance matrix (which carries the layout) and the threshold schedule.
///
/// Passed explicitly into every call so the core can be driven without any
/// process-wide setup.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    matrix: &'a DistanceMatrix,
    thresholds: &'a Thresholds,
}

impl<'a> Context<'a> {
    /// Bundle a matrix and a threshold schedule for one run.
    #[must_use]
    #[inline]
    pub const fn new(matrix: &'a DistanceMatrix, thresholds: &'a Thresholds) -> Self {
        Self { matrix, thresholds }
    }
}

/// One level of the clustering tree.
///
/// An internal node owns child nodes keyed by branch identifier, covering the
/// next-finer threshold level; a leaf owns the terminal member list at the
/// exact-match level. Shared attributes are exposed through pattern-matched
/// accessors rather than virtual dispatch.
#[derive(Debug, Clone)]
enum Node {
    Internal {
        founder: SampleKey,
        code: Code,
        level: usize,
        /// Maximum pairwise distance among all members under this node,
        /// recomputed in full after every insertion that touches the node.
        max_dist: f64,
        /// Children in ascending branch order, which equals creation order
        /// because branch identifiers only ever grow.
        children: BTreeMap<BranchId, Node>,
        next_branch: BranchId,
    },
    Leaf {
        founder: SampleKey,
        code: Code,
        level: usize,
        members: SmallVec<[SampleKey; 4]>,
    },
}

impl Node {
    /// Build the chain of nodes a brand-new founder occupies, from `level`
    /// down to the leaf level, with branch `1` at every step.
    fn chain(key: &SampleKey, level: usize, code: Code, thresholds: &Thresholds) -> Self {
        if level == thresholds.leaf_level() {
            Self::Leaf {
                founder: key.clone(),
                code,
                level,
                members: smallvec![key.clone()],
            }
        } else {
            let child = Self::chain(key, level + 1, code.child(FIRST_BRANCH), thresholds);
            let mut children = BTreeMap::new();
            children.insert(FIRST_BRANCH, child);
            Self::Internal {
                founder: key.clone(),
                code,
                level,
                max_dist: 0.0,
                children,
                next_branch: FIRST_BRANCH + 1,
            }
        }
    }

    fn founder(&self) -> &SampleKey {
        match self {
            Self::Internal { founder, .. } | Self::Leaf { founder, .. } => founder,
        }
    }

    fn code(&self) -> &Code {
        match self {
            Self::Internal { code, .. } | Self::Leaf { code, .. } => code,
        }
    }

    fn level(&self) -> usize {
        match self {
            Self::Internal { level, .. } | Self::Leaf { level, .. } => *level,
        }
    }

    /// Leaves are 0 by construction: their members matched at distance 0.
    fn max_dist(&self) -> f64 {
        match self {
            Self::Internal { max_dist, .. } => *max_dist,
            Self::Leaf { .. } => 0.0,
        }
    }

    /// Append references to every member under this node, leaves left to
    /// right in branch order.
    fn collect_members<'a>(&'a self, out: &mut Vec<&'a SampleKey>) {
        match self {
            Self::Leaf { members, .. } => out.extend(members.iter()),
            Self::Internal { children, .. } => {
                for child in children.values() {
                    child.collect_members(out);
                }
            }
        }
    }

    /// Consume the node, yielding its members in branch order.
    fn into_members(self) -> Vec<SampleKey> {
        match self {
            Self::Leaf { members, .. } => members.into_vec(),
            Self::Internal { children, .. } => children
                .into_values()
                .flat_map(Self::into_members)
                .collect(),
        }
    }

    fn member_count(&self) -> usize {
        match self {
            Self::Leaf { members, .. } => members.len(),
            Self::Internal { children, .. } => children.values().map(Self::member_count).sum(),
        }
    }

    fn contains(&self, key: &SampleKey) -> bool {
        match self {
            Self::Leaf { members, .. } => members.contains(key),
            Self::Internal { children, .. } => children.values().any(|child| child.contains(key)),
        }
    }

    /// Whether any member of this node lies within `threshold` of `key`.
    ///
    /// This is the buffer-zone fallback: the acceptance criterion itself, run
    /// only after the `2*t + max_dist` filter decided the scan is worth it.
    fn any_member_within(
        &self,
        key: &SampleKey,
        threshold: f64,
        ctx: &Context<'_>,
    ) -> Result<bool, Error> {
        let mut members = Vec::new();
        self.collect_members(&mut members);
        for member in members {
            if ctx.matrix.distance(key, member)? <= threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Insert `key` somewhere under this node, then recompute this node's
    /// maximum pairwise member distance from scratch.
    fn add_member(&mut self, key: &SampleKey, ctx: &Context<'_>) -> Result<(), Error> {
        debug!("adding {key} to node {}", self.code());
        match self {
            Self::Leaf { members, .. } => {
                // Membership was already decided at the level above.
                members.push(key.clone());
                Ok(())
            }
            Self::Internal {
                code,
                level,
                max_dist,
                children,
                next_branch,
                ..
            } => {
                insert_into_siblings(children, next_branch, code, *level + 1, key, ctx)?;
                let recomputed = {
                    let mut members = Vec::new();
                    for child in children.values() {
                        child.collect_members(&mut members);
                    }
                    max_pairwise_distance(&members, ctx)?
                };
                *max_dist = recomputed;
                Ok(())
            }
        }
    }

    /// The code of the deepest node on the path to `key` that holds more than
    /// one member; empty if even this node is a singleton.
    fn code_for(&self, key: &SampleKey) -> Code {
        if self.member_count() == 1 {
            return Code::default();
        }
        match self {
            Self::Leaf { code, .. } => code.clone(),
            Self::Internal { code, children, .. } => {
                for child in children.values() {
                    if child.contains(key) {
                        return if child.member_count() > 1 {
                            child.code_for(key)
                        } else {
                            code.clone()
                        };
                    }
                }
                Code::default()
            }
        }
    }

    /// One line per attribute, indented by level. Diagnostic only.
    fn render_into(&self, out: &mut String) {
        use core::fmt::Write as _;
        let tabs = "\t".repeat(self.level());
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{tabs}code: {}", self.code());
        let _ = writeln!(out, "{tabs}level: {}", self.level());
        let _ = writeln!(out, "{tabs}founder: {}", self.founder());
        let _ = writeln!(out, "{tabs}max_dist: {}", self.max_dist());
        match self {
            Self::Leaf { members, .. } => {
                let ids: Vec<&str> = members.iter().map(SampleKey::id).collect();
                let _ = writeln!(out, "{tabs}members: {}", ids.join(","));
            }
            Self::Internal { children, .. } => {
                for child in children.values() {
                    child.render_into(out);
                }
            }
        }
    }
}

/// The maximum pairwise distance over `members`, or 0 for fewer than two.
///
/// This is the full recomputation the insertion algorithm performs on every
/// touched node; it reads only committed tree state, so the pair scans run in
/// parallel.
fn max_pairwise_distance(members: &[&SampleKey], ctx: &Context<'_>) -> Result<f64, Error> {
    if members.len() < 2 {
        return Ok(0.0);
    }
    (1..members.len())
        .into_par_iter()
        .map(|i| {
            let mut largest = 0.0_f64;
            for j in 0..i {
                largest = largest.max(ctx.matrix.distance(members[i], members[j])?);
            }
            Ok(largest)
        })
        .try_reduce(|| 0.0, |a, b| Ok(a.max(b)))
}

/// Decide where `key` belongs among `siblings` at `level`, applying the
/// zero / one / many-candidate policy.
///
/// This one procedure serves both the forest roots (level 0) and, through
/// [`Node::add_member`], the children of every internal node.
fn insert_into_siblings(
    siblings: &mut BTreeMap<BranchId, Node>,
    next_branch: &mut BranchId,
    parent_code: &Code,
    level: usize,
    key: &SampleKey,
    ctx: &Context<'_>,
) -> Result<(), Error> {
    let threshold = ctx.thresholds.at(level);
    let mut matched: SmallVec<[BranchId; 4]> = SmallVec::new();
    for (&branch, node) in siblings.iter() {
        let dist = ctx.matrix.distance(key, node.founder())?;
        if dist <= threshold {
            matched.push(branch);
        } else if dist <= 2.0 * threshold + node.max_dist()
            && node.any_member_within(key, threshold, ctx)?
        {
            // Founder-only comparison can miss valid matches when the node's
            // internal diameter is large; the bound above is a loose filter
            // deciding whether the member scan is worth running.
            matched.push(branch);
        }
    }
    match matched.as_slice() {
        [] => {
            let branch = *next_branch;
            *next_branch += 1;
            let node = Node::chain(key, level, parent_code.child(branch), ctx.thresholds);
            siblings.insert(branch, node);
        }
        [branch] => {
            siblings
                .get_mut(branch)
                .expect("A matched branch should still be present among the siblings.")
                .add_member(key, ctx)?;
        }
        _ => {
            // Ambiguity: the new sample bridges several siblings. Replace them
            // all with one fresh node founded by the sample, re-inserting
            // every absorbed member in discovery order. The fresh node only
            // becomes a sibling after the merge completes, so it never
            // matches against itself.
            let branch = *next_branch;
            *next_branch += 1;
            let code = parent_code.child(branch);
            if log::log_enabled!(log::Level::Debug) {
                let absorbed: Vec<String> = matched
                    .iter()
                    .filter_map(|old| siblings.get(old))
                    .map(|node| format!("{} (n={})", node.code(), node.member_count()))
                    .collect();
                debug!("merging {} into new node {code}", absorbed.join(", "));
            }
            let mut merged = Node::chain(key, level, code, ctx.thresholds);
            for old in &matched {
                let node = siblings
                    .remove(old)
                    .expect("A matched branch should still be present when the merge collects it.");
                for member in node.into_members() {
                    merged.add_member(&member, ctx)?;
                }
            }
            siblings.insert(branch, merged);
        }
    }
    Ok(())
}

/// The set of top-level clustering trees: the entry point for inserting
/// samples and reading their codes back out.
///
/// Roots sit at threshold level 0. The forest owns its roots exclusively, and
/// every node owns its children exclusively; the only cross-reference in the
/// tree is the founder key, which is a value.
#[derive(Debug, Clone)]
pub struct ClusterForest {
    roots: BTreeMap<BranchId, Node>,
    next_branch: BranchId,
    seen: FxHashSet<String>,
}

impl ClusterForest {
    /// An empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: BTreeMap::new(),
            next_branch: FIRST_BRANCH,
            seen: FxHashSet::default(),
        }
    }

    /// Build a forest by inserting `samples` one at a time, in order.
    pub fn build(samples: &[SampleKey], ctx: &Context<'_>) -> Result<Self, Error> {
        let mut forest = Self::new();
        for key in samples {
            forest.insert(key, ctx)?;
        }
        Ok(forest)
    }

    /// Insert one sample.
    ///
    /// Fails with [`Error::DuplicateIdentifier`] if a sample with the same
    /// identifier was inserted before. A failed insertion leaves the tree in
    /// an unspecified state; the run should be aborted, not resumed.
    pub fn insert(&mut self, key: &SampleKey, ctx: &Context<'_>) -> Result<(), Error> {
        if !self.seen.insert(key.id().to_owned()) {
            return Err(Error::DuplicateIdentifier(key.id().to_owned()));
        }
        insert_into_siblings(
            &mut self.roots,
            &mut self.next_branch,
            &Code::default(),
            0,
            key,
            ctx,
        )
    }

    /// The number of top-level trees.
    #[must_use]
    #[inline]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Whether no sample has been inserted yet.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// The code of the deepest non-singleton cluster containing `key`.
    ///
    /// Returns the empty code for singletons and for keys that were never
    /// inserted.
    #[must_use]
    pub fn code_for(&self, key: &SampleKey) -> Code {
        for root in self.roots.values() {
            if root.contains(key) {
                return root.code_for(key);
            }
        }
        Code::default()
    }

    /// A diagnostic dump of the whole forest: one line per attribute per
    /// node, indented by tree depth.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for root in self.roots.values() {
            root.render_into(&mut out);
        }
        out
    }
}

impl Default for ClusterForest {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert `samples` in order and return their codes, aligned with the input.
pub fn assign_codes(
    samples: &[SampleKey],
    matrix: &DistanceMatrix,
    thresholds: &Thresholds,
) -> Result<Vec<Code>, Error> {
    let ctx = Context::new(matrix, thresholds);
    let forest = ClusterForest::build(samples, &ctx)?;
    Ok(samples.iter().map(|key| forest.code_for(key)).collect())
}

/// An error-type for building and querying the clustering tree.
#[derive(Debug, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "Extending this enum should be a breaking change."
)]
pub enum Error {
    /// A sample's cached row index has no populated cell in the matrix.
    OutOfRangeIndex {
        /// The failing row or column index.
        index: usize,
        /// The size of the dimension it was checked against.
        len: usize,
    },
    /// An empty threshold schedule was supplied.
    EmptyThresholds,
    /// A threshold is negative or NaN.
    NegativeThreshold(f64),
    /// A threshold (at this position) is larger than its predecessor.
    UnsortedThresholds {
        /// The offending position in the supplied schedule.
        position: usize,
    },
    /// Two input samples share an identifier.
    DuplicateIdentifier(String),
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match *self {
            Self::OutOfRangeIndex { index, len } => {
                format!("sample index {index} is outside the matrix (size {len})")
            }
            Self::EmptyThresholds => "no thresholds supplied".to_owned(),
            Self::NegativeThreshold(value) => {
                format!("threshold {value} is negative or not a number")
            }
            Self::UnsortedThresholds { position } => {
                format!("threshold at position {position} is larger than its predecessor")
            }
            Self::DuplicateIdentifier(ref id) => {
                format!("duplicate sample identifier {id:?}")
            }
        };
        f.write_str(&msg)
    }
}

#[expect(
    clippy::absolute_paths,
    reason = "Not worth bringing into scope for one use."
)]
impl core::error::Error for Error {}
