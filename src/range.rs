//! Range search results.
//!
//! A range search returns a variable number of hits per query, stored CSR-style: the hits
//! of query `i` are `labels[lims[i]..lims[i + 1]]` with matching `distances`. Workers collect
//! hits in [`RangeSearchPartialResult`]s (one per worker, covering disjoint queries) which
//! are merged once at the end.

/// Hits of one query, in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQueryResult {
    /// Query number.
    pub qno: usize,
    /// Hit labels.
    pub labels: Vec<i64>,
    /// Hit distances.
    pub distances: Vec<f32>,
}

impl RangeQueryResult {
    /// Record one hit.
    #[inline]
    pub fn add(&mut self, dis: f32, id: i64) {
        self.labels.push(id);
        self.distances.push(dis);
    }

    /// Number of hits.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if no hits were recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Results of the queries handled by one worker.
#[derive(Debug, Clone, Default)]
pub struct RangeSearchPartialResult {
    /// Per-query results.
    pub queries: Vec<RangeQueryResult>,
}

impl RangeSearchPartialResult {
    /// Start collecting hits for query `qno`.
    pub fn new_result(&mut self, qno: usize) -> &mut RangeQueryResult {
        self.queries.push(RangeQueryResult {
            qno,
            ..Default::default()
        });
        let last = self.queries.len() - 1;
        &mut self.queries[last]
    }
}

/// Hits of `nq` queries in CSR layout.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSearchResult {
    /// Number of queries.
    pub nq: usize,
    /// Offsets, size `nq + 1`.
    pub lims: Vec<usize>,
    /// Hit labels.
    pub labels: Vec<i64>,
    /// Hit distances (not sorted).
    pub distances: Vec<f32>,
}

impl RangeSearchResult {
    /// Result with no hits for any of `nq` queries.
    #[must_use]
    pub fn empty(nq: usize) -> Self {
        Self {
            nq,
            lims: vec![0; nq + 1],
            labels: Vec::new(),
            distances: Vec::new(),
        }
    }

    /// Merge partial results into one result over `nq` queries.
    ///
    /// Queries absent from every partial result get an empty slice. When the same query
    /// appears more than once, hits are concatenated in partial-result order.
    #[must_use]
    pub fn merge(nq: usize, partials: Vec<RangeSearchPartialResult>) -> Self {
        let mut counts = vec![0usize; nq];
        for q in partials.iter().flat_map(|p| &p.queries) {
            debug_assert!(q.qno < nq);
            counts[q.qno] += q.len();
        }
        let mut lims = Vec::with_capacity(nq + 1);
        lims.push(0);
        for c in &counts {
            let last = lims[lims.len() - 1];
            lims.push(last + c);
        }
        let total = lims[nq];
        let mut labels = vec![0i64; total];
        let mut distances = vec![0.0f32; total];
        let mut cursor: Vec<usize> = lims[..nq].to_vec();
        for q in partials.into_iter().flat_map(|p| p.queries) {
            let at = cursor[q.qno];
            labels[at..at + q.len()].copy_from_slice(&q.labels);
            distances[at..at + q.len()].copy_from_slice(&q.distances);
            cursor[q.qno] += q.len();
        }
        Self {
            nq,
            lims,
            labels,
            distances,
        }
    }

    /// `(labels, distances)` of query `i`.
    #[must_use]
    pub fn query(&self, i: usize) -> (&[i64], &[f32]) {
        let r = self.lims[i]..self.lims[i + 1];
        (&self.labels[r.clone()], &self.distances[r])
    }

    /// Total number of hits.
    #[must_use]
    pub fn total(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_orders_by_query() {
        let mut a = RangeSearchPartialResult::default();
        a.new_result(2).add(0.5, 7);
        let mut b = RangeSearchPartialResult::default();
        {
            let r = b.new_result(0);
            r.add(0.1, 1);
            r.add(0.2, 3);
        }
        b.new_result(1);
        let res = RangeSearchResult::merge(4, vec![a, b]);
        assert_eq!(res.lims, vec![0, 2, 2, 3, 3]);
        assert_eq!(res.query(0).0, &[1, 3]);
        assert!(res.query(1).0.is_empty());
        assert_eq!(res.query(2), (&[7i64][..], &[0.5f32][..]));
        assert_eq!(res.total(), 3);
    }

    #[test]
    fn empty_result() {
        let res = RangeSearchResult::empty(3);
        assert_eq!(res.lims.len(), 4);
        assert!(res.query(2).0.is_empty());
    }
}
