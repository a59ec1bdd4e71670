//! Calculator arithmetic, independent of the transport.

use tracing::debug;

use crate::status::Status;

/// Stateless calculator logic shared by every call.
#[derive(Debug, Clone, Default)]
pub struct Service;

impl Service {
    pub fn new() -> Self {
        Self
    }

    /// Sum of two numbers, wrapping on overflow.
    pub fn add(&self, first: i64, second: i64) -> i64 {
        debug!(first, second, "performing addition");
        first.wrapping_add(second)
    }

    pub fn prime_factors(&self, number: i64) -> PrimeFactors {
        debug!(number, "decomposing into primes");
        prime_factors(number)
    }

    pub fn square_root(&self, number: i32) -> Result<f64, Status> {
        debug!(number, "taking square root");
        square_root(number)
    }
}

/// Prime factors of `number` in non-decreasing order.
///
/// Yields nothing for `number <= 1`.
pub fn prime_factors(number: i64) -> PrimeFactors {
    PrimeFactors {
        remaining: number,
        divisor: 2,
    }
}

/// Iterator returned by [`prime_factors`].
#[derive(Debug, Clone)]
pub struct PrimeFactors {
    remaining: i64,
    divisor: i64,
}

impl Iterator for PrimeFactors {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.remaining <= 1 {
            return None;
        }
        while self.remaining % self.divisor != 0 {
            // No divisor up to the square root: what is left is prime.
            if self.divisor > self.remaining / self.divisor {
                self.divisor = self.remaining;
                break;
            }
            self.divisor += 1;
        }
        self.remaining /= self.divisor;
        Some(self.divisor)
    }
}

/// Running mean of a stream of integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Average {
    sum: i128,
    count: u64,
}

impl Average {
    pub fn push(&mut self, number: i64) {
        self.sum += i128::from(number);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `sum / count`, or `NaN` before the first number.
    pub fn value(&self) -> f64 {
        self.sum as f64 / self.count as f64
    }
}

/// Largest value seen so far; empty until the first value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningMax(Option<i64>);

impl RunningMax {
    /// Fold in `number` and return the current maximum.
    pub fn observe(&mut self, number: i64) -> i64 {
        let max = match self.0 {
            Some(current) if current >= number => current,
            _ => number,
        };
        self.0 = Some(max);
        max
    }

    pub fn get(&self) -> Option<i64> {
        self.0
    }
}

/// Square root of a strictly positive number.
///
/// # Errors
///
/// `InvalidArgument` naming the number when it is zero or negative.
pub fn square_root(number: i32) -> Result<f64, Status> {
    if number > 0 {
        Ok(f64::from(number).sqrt())
    } else {
        Err(Status::invalid_argument(format!(
            "The number being sent is not positive (number sent: {number})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn test_add() {
        let service = Service::new();
        assert_eq!(service.add(3, 10), 13);
        assert_eq!(service.add(-5, 3), -2);
        assert_eq!(service.add(i64::MAX, 1), i64::MIN);
    }

    #[test]
    fn test_prime_factors_of_120() {
        assert_eq!(prime_factors(120).collect::<Vec<_>>(), vec![2, 2, 2, 3, 5]);
    }

    #[test]
    fn test_prime_factors_product_and_order() {
        for n in 1..=2000i64 {
            let factors: Vec<i64> = prime_factors(n).collect();
            assert_eq!(factors.iter().product::<i64>(), n, "product for {n}");
            assert!(factors.windows(2).all(|w| w[0] <= w[1]), "order for {n}");
        }
    }

    #[test]
    fn test_prime_factors_edge_cases() {
        assert!(prime_factors(1).next().is_none());
        assert!(prime_factors(0).next().is_none());
        assert!(prime_factors(-12).next().is_none());
        assert_eq!(prime_factors(97).collect::<Vec<_>>(), vec![97]);
        assert_eq!(
            prime_factors(1_000_000_007).collect::<Vec<_>>(),
            vec![1_000_000_007]
        );
    }

    #[test]
    fn test_average() {
        let mut average = Average::default();
        for n in 1..=5000 {
            average.push(n);
        }
        assert_eq!(average.count(), 5000);
        assert!((average.value() - 2500.5).abs() < 1e-9);
    }

    #[test]
    fn test_average_of_nothing_is_nan() {
        assert!(Average::default().value().is_nan());
    }

    #[test]
    fn test_average_does_not_overflow() {
        let mut average = Average::default();
        average.push(i64::MAX);
        average.push(i64::MAX);
        assert_eq!(average.value(), i64::MAX as f64);
    }

    #[test]
    fn test_running_max() {
        let mut max = RunningMax::default();
        assert_eq!(max.get(), None);

        let seen: Vec<i64> = [1, 5, 3, 6, 2, 20].iter().map(|&n| max.observe(n)).collect();
        assert_eq!(seen, vec![1, 5, 5, 6, 6, 20]);
    }

    #[test]
    fn test_running_max_below_old_sentinel() {
        let mut max = RunningMax::default();
        assert_eq!(max.observe(-200_000), -200_000);
        assert_eq!(max.observe(-300_000), -200_000);
    }

    #[test]
    fn test_square_root() {
        assert_eq!(square_root(16).unwrap(), 4.0);
        assert!((square_root(2).unwrap() - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn test_square_root_rejects_non_positive() {
        for n in [0, -1, i32::MIN] {
            let status = square_root(n).unwrap_err();
            assert_eq!(status.code(), Code::InvalidArgument);
            assert!(status.message().contains(&n.to_string()));
        }
        assert_eq!(
            square_root(-1).unwrap_err().message(),
            "The number being sent is not positive (number sent: -1)"
        );
    }
}
