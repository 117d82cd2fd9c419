//! Butcher tableaus of the embedded Runge-Kutta 4(5) pairs.
//!
//! Both pairs advance the solution with the 5th-order weights and estimate
//! the error from the difference with the embedded 4th-order weights.
//!
//! - Cash, J.R. & Karp, A.H. (1990). "A variable order Runge-Kutta method
//!   for initial value problems with rapidly varying right-hand sides".
//!   ACM TOMS 16, 201-222.
//! - Dormand, J.R. & Prince, P.J. (1980). "A family of embedded Runge-Kutta
//!   formulae". J. Comp. Appl. Math. 6, 19-26.

/// Largest number of stages of any tableau in this module
pub const MAX_STAGES: usize = 7;

/// Coefficients of an explicit embedded Runge-Kutta pair.
///
/// Stage i is evaluated at `y + h * sum_{j<i} a[i][j] * k_j`. The solution
/// is `y + h * sum b[i] k_i` and the error `h * sum b_err[i] k_i`.
#[derive(Debug, Clone, Copy)]
pub struct Tableau {
    /// Human-readable method name
    pub name: &'static str,
    /// Number of stages actually used
    pub stages: usize,
    /// Nodes
    pub c: [f64; MAX_STAGES],
    /// Runge-Kutta matrix (strictly lower triangular)
    pub a: [[f64; MAX_STAGES]; MAX_STAGES],
    /// Weights of the propagated (5th order) solution
    pub b: [f64; MAX_STAGES],
    /// Weights of the error estimate: b minus the embedded weights
    pub b_err: [f64; MAX_STAGES],
    /// Order used for step-size control (order of the error estimate)
    pub order: u32,
    /// First stage of the next step equals the last stage of this one
    pub fsal: bool,
}

const CK_B5: [f64; MAX_STAGES] = [
    37.0 / 378.0,
    0.0,
    250.0 / 621.0,
    125.0 / 594.0,
    0.0,
    512.0 / 1771.0,
    0.0,
];

const CK_B4: [f64; MAX_STAGES] = [
    2825.0 / 27648.0,
    0.0,
    18575.0 / 48384.0,
    13525.0 / 55296.0,
    277.0 / 14336.0,
    1.0 / 4.0,
    0.0,
];

/// Cash-Karp 4(5): six stages, no stage reuse.
pub const CASH_KARP: Tableau = Tableau {
    name: "Cash-Karp 4(5)",
    stages: 6,
    c: [0.0, 1.0 / 5.0, 3.0 / 10.0, 3.0 / 5.0, 1.0, 7.0 / 8.0, 0.0],
    a: [
        [0.0; MAX_STAGES],
        [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [3.0 / 10.0, -9.0 / 10.0, 6.0 / 5.0, 0.0, 0.0, 0.0, 0.0],
        [-11.0 / 54.0, 5.0 / 2.0, -70.0 / 27.0, 35.0 / 27.0, 0.0, 0.0, 0.0],
        [
            1631.0 / 55296.0,
            175.0 / 512.0,
            575.0 / 13824.0,
            44275.0 / 110592.0,
            253.0 / 4096.0,
            0.0,
            0.0,
        ],
        [0.0; MAX_STAGES],
    ],
    b: CK_B5,
    b_err: [
        CK_B5[0] - CK_B4[0],
        CK_B5[1] - CK_B4[1],
        CK_B5[2] - CK_B4[2],
        CK_B5[3] - CK_B4[3],
        CK_B5[4] - CK_B4[4],
        CK_B5[5] - CK_B4[5],
        CK_B5[6] - CK_B4[6],
    ],
    order: 4,
    fsal: false,
};

const DP_B5: [f64; MAX_STAGES] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
    0.0,
];

const DP_B4: [f64; MAX_STAGES] = [
    5179.0 / 57600.0,
    0.0,
    7571.0 / 16695.0,
    393.0 / 640.0,
    -92097.0 / 339200.0,
    187.0 / 2100.0,
    1.0 / 40.0,
];

/// Dormand-Prince 4(5): seven stages, the last evaluated at the new point.
pub const DORMAND_PRINCE: Tableau = Tableau {
    name: "Dormand-Prince 4(5)",
    stages: 7,
    c: [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: [
        [0.0; MAX_STAGES],
        [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0, 0.0],
        [
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
            0.0,
            0.0,
            0.0,
        ],
        [
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
            0.0,
            0.0,
        ],
        // FSAL row: identical to the 5th-order weights
        DP_B5,
    ],
    b: DP_B5,
    b_err: [
        DP_B5[0] - DP_B4[0],
        DP_B5[1] - DP_B4[1],
        DP_B5[2] - DP_B4[2],
        DP_B5[3] - DP_B4[3],
        DP_B5[4] - DP_B4[4],
        DP_B5[5] - DP_B4[5],
        DP_B5[6] - DP_B4[6],
    ],
    order: 4,
    fsal: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-14;

    #[test]
    fn test_row_sum_condition() {
        for tab in [CASH_KARP, DORMAND_PRINCE] {
            for i in 0..tab.stages {
                let row_sum: f64 = tab.a[i].iter().sum();
                assert!(
                    (row_sum - tab.c[i]).abs() < TOL,
                    "{}: row {} sum = {}, expected c[{}] = {}",
                    tab.name,
                    i,
                    row_sum,
                    i,
                    tab.c[i]
                );
            }
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        for tab in [CASH_KARP, DORMAND_PRINCE] {
            let b_sum: f64 = tab.b.iter().sum();
            assert!((b_sum - 1.0).abs() < TOL, "{}: b sums to {}", tab.name, b_sum);
            let err_sum: f64 = tab.b_err.iter().sum();
            assert!(err_sum.abs() < TOL, "{}: b_err sums to {}", tab.name, err_sum);
        }
    }

    #[test]
    fn test_third_order_condition() {
        // sum b_i c_i^2 = 1/3 for the 5th-order weights
        for tab in [CASH_KARP, DORMAND_PRINCE] {
            let s: f64 = (0..tab.stages).map(|i| tab.b[i] * tab.c[i] * tab.c[i]).sum();
            assert!((s - 1.0 / 3.0).abs() < TOL, "{}: sum b c^2 = {}", tab.name, s);
        }
    }

    #[test]
    fn test_fsal_row_matches_weights() {
        let last = DORMAND_PRINCE.stages - 1;
        assert_eq!(DORMAND_PRINCE.a[last], DORMAND_PRINCE.b);
        assert_eq!(DORMAND_PRINCE.c[last], 1.0);
    }
}
