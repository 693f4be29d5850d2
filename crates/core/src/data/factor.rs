use indexmap::IndexMap;

/// A grouping factor: observations mapped onto a set of named levels.
///
/// Levels keep their order of first appearance, so the level index of a
/// random effect is stable for a given row order of the data.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingFactor {
    levels: IndexMap<String, usize>,
    refs: Vec<usize>,
}

impl GroupingFactor {
    /// Build a factor from string values.
    ///
    /// # Examples
    /// ```
    /// use lmefit_core::data::GroupingFactor;
    ///
    /// let f = GroupingFactor::new(&["s1", "s2", "s1", "s3"]);
    /// assert_eq!(f.n_levels(), 3);
    /// assert_eq!(f.refs(), &[0, 1, 0, 2]);
    /// ```
    pub fn new<S: AsRef<str>>(values: &[S]) -> Self {
        let mut levels = IndexMap::new();
        let mut refs = Vec::with_capacity(values.len());
        for val in values {
            let next = levels.len();
            let code = *levels.entry(val.as_ref().to_string()).or_insert(next);
            refs.push(code);
        }
        GroupingFactor { levels, refs }
    }

    /// Interaction of two factors, e.g. `class` within `school`.
    ///
    /// Level names are joined with `:` and a level exists only for the
    /// combinations that occur in the data.
    pub fn interaction(outer: &GroupingFactor, inner: &GroupingFactor) -> Self {
        assert_eq!(
            outer.len(),
            inner.len(),
            "interaction of factors with {} and {} observations",
            outer.len(),
            inner.len()
        );
        let names: Vec<String> = outer
            .refs
            .iter()
            .zip(inner.refs.iter())
            .map(|(&a, &b)| format!("{}:{}", outer.level_name(a), inner.level_name(b)))
            .collect();
        GroupingFactor::new(&names)
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Level index of each observation.
    pub fn refs(&self) -> &[usize] {
        &self.refs
    }

    /// Level names in index order.
    pub fn level_names(&self) -> Vec<String> {
        self.levels.keys().cloned().collect()
    }

    /// Name of level `code`. Panics if the code is out of range.
    pub fn level_name(&self, code: usize) -> &str {
        self.levels
            .get_index(code)
            .map(|(name, _)| name.as_str())
            .unwrap_or_else(|| panic!("level code {} out of range", code))
    }

    /// Number of observations at each level.
    pub fn level_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_levels()];
        for &r in &self.refs {
            counts[r] += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
