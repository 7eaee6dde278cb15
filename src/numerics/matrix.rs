use nalgebra::DMatrix;

/// Row-wise sparse accumulation matrix.
///
/// Assembly wants cheap scattered adds and whole-row operations (the
/// interface stitcher moves and clears rows between the region and boundary
/// passes); the Krylov backend wants CSR. So rows are kept as small unsorted
/// coordinate lists during assembly and compressed once at the end.
pub struct AijMatrix {
    n: usize,
    rows: Vec<Vec<(usize, f64)>>,
}

impl AijMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            rows: vec![Vec::new(); n],
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Accumulate into (i, j).
    pub fn add(&mut self, i: usize, j: usize, v: f64) {
        let row = &mut self.rows[i];
        if let Some(entry) = row.iter_mut().find(|(c, _)| *c == j) {
            entry.1 += v;
        } else {
            row.push((j, v));
        }
    }

    /// Make sure (i, j) exists structurally, without changing its value.
    /// Boundary passes reserve every column they will write later, so row
    /// surgery never has to grow a compressed pattern.
    pub fn reserve_entry(&mut self, i: usize, j: usize) {
        let row = &mut self.rows[i];
        if !row.iter().any(|(c, _)| *c == j) {
            row.push((j, 0.0));
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.rows[i]
            .iter()
            .find(|(c, _)| *c == j)
            .map_or(0.0, |(_, v)| *v)
    }

    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    /// dst += src, entry-wise by column.
    pub fn add_row_to_row(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let entries = self.rows[src].clone();
        for (j, v) in entries {
            self.add(dst, j, v);
        }
    }

    /// Drop every entry of the row, optionally leaving a diagonal.
    pub fn zero_row(&mut self, i: usize, diag: f64) {
        self.rows[i].clear();
        if diag != 0.0 {
            self.rows[i].push((i, diag));
        }
    }

    pub fn scale_row(&mut self, i: usize, s: f64) {
        for (_, v) in &mut self.rows[i] {
            *v *= s;
        }
    }

    pub fn nnz(&self) -> usize {
        self.rows.iter().map(|r| r.len()).sum()
    }

    /// Compress to CSR for the Krylov solve: per-row sort by column, merge
    /// duplicates.
    pub fn into_csr(self) -> kryst::matrix::sparse::CsrMatrix<f64> {
        let n = self.n;
        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::with_capacity(self.nnz());
        let mut data = Vec::with_capacity(self.nnz());
        indptr.push(0);
        for mut row in self.rows {
            row.sort_unstable_by_key(|(c, _)| *c);
            let mut it = row.into_iter();
            if let Some((mut col, mut sum)) = it.next() {
                for (c, v) in it {
                    if c == col {
                        sum += v;
                    } else {
                        indices.push(col);
                        data.push(sum);
                        col = c;
                        sum = v;
                    }
                }
                indices.push(col);
                data.push(sum);
            }
            indptr.push(indices.len());
        }
        kryst::matrix::sparse::CsrMatrix::from_csr(n, n, indptr, indices, data)
    }

    /// Dense view for tests and small-system inspection.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.n, self.n);
        for (i, row) in self.rows.iter().enumerate() {
            for &(j, v) in row {
                m[(i, j)] += v;
            }
        }
        m
    }
}
