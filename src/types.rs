use serde::{Deserialize, Serialize};

/// Latent market state governing the return and inflation distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Growth,
    Crisis,
}

impl Regime {
    /// Pick the value associated with this regime.
    pub fn select<T>(self, growth: T, crisis: T) -> T {
        match self {
            Regime::Growth => growth,
            Regime::Crisis => crisis,
        }
    }
}

/// Simulation time in months (0 = the month the run starts).
/// One simulated year is 12 months; age advances by 1/12 per month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Month(pub u32);

impl Month {
    pub const PER_YEAR: u32 = 12;

    /// Age at the start of this month for someone who is `current_age` at month 0.
    pub fn age(self, current_age: f64) -> f64 {
        current_age + self.0 as f64 / Self::PER_YEAR as f64
    }

    /// Nearest month index for `age`, relative to `current_age`. Negative when
    /// `age` lies before the run starts.
    pub fn nearest(age: f64, current_age: f64) -> i64 {
        ((age - current_age) * Self::PER_YEAR as f64).round() as i64
    }

    /// True on the last month of a simulated year.
    pub fn closes_year(self) -> bool {
        self.0 % Self::PER_YEAR == Self::PER_YEAR - 1
    }

    /// True on the first month of every simulated year after the first.
    pub fn opens_new_year(self) -> bool {
        self.0 > 0 && self.0 % Self::PER_YEAR == 0
    }
}

/// Dense `[path, month]` matrix of f64, stored row-major in one buffer so
/// each path's months are contiguous. Rows are written once, by their path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMatrix {
    data: Vec<f64>,
    months: usize,
}

impl PathMatrix {
    pub fn filled(paths: usize, months: usize, value: f64) -> Self {
        PathMatrix { data: vec![value; paths * months], months }
    }

    pub fn paths(&self) -> usize {
        if self.months == 0 { 0 } else { self.data.len() / self.months }
    }

    pub fn months(&self) -> usize {
        self.months
    }

    pub fn row(&self, path: usize) -> &[f64] {
        &self.data[path * self.months..(path + 1) * self.months]
    }

    /// Mutable rows, one per path, for filling in parallel.
    pub fn rows_mut(&mut self) -> std::slice::ChunksMut<'_, f64> {
        self.data.chunks_mut(self.months.max(1))
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Values of every path at `month`, in path order.
    pub fn column(&self, month: usize) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().skip(month).step_by(self.months.max(1)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matrix_is_row_major() {
        let mut m = PathMatrix::filled(3, 4, 0.0);
        for (path, row) in m.rows_mut().enumerate() {
            for (month, v) in row.iter_mut().enumerate() {
                *v = (path * 10 + month) as f64;
            }
        }
        assert_eq!(m.paths(), 3);
        assert_eq!(m.months(), 4);
        assert_eq!(m.row(1), &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(m.row(2)[3], 23.0);
        assert_eq!(m.column(2).collect::<Vec<_>>(), vec![2.0, 12.0, 22.0]);
    }

    #[test]
    fn month_age_advances_by_twelfths() {
        assert_eq!(Month(0).age(35.0), 35.0);
        assert!((Month(6).age(35.0) - 35.5).abs() < 1e-12);
        assert_eq!(Month(60).age(35.0), 40.0);
    }

    #[test]
    fn nearest_month_rounds() {
        assert_eq!(Month::nearest(40.0, 35.0), 60);
        assert_eq!(Month::nearest(35.04, 35.0), 0);
        assert_eq!(Month::nearest(35.05, 35.0), 1);
        assert_eq!(Month::nearest(30.0, 35.0), -60);
    }

    #[test]
    fn year_boundaries() {
        assert!(Month(11).closes_year());
        assert!(!Month(12).closes_year());
        assert!(Month(12).opens_new_year());
        assert!(!Month(0).opens_new_year());
    }

    #[test]
    fn regime_select() {
        assert_eq!(Regime::Growth.select(1, 2), 1);
        assert_eq!(Regime::Crisis.select(1, 2), 2);
    }
}
