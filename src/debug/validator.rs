//! Loss validation against reference values
//!
//! Compares losses computed here to values printed by the reference
//! training script (or stored next to a dumped batch) with configurable
//! tolerances.

use anyhow::{Context, Result};
use candle_core::Tensor;
use std::path::Path;
use tracing::warn;

use super::npy::load_npy_f32;
use crate::losses::HeadLosses;

/// Validation configuration
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Absolute tolerance for float comparisons
    pub atol: f32,
    /// Relative tolerance for float comparisons
    pub rtol: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            atol: 1e-4,
            rtol: 1e-3,
        }
    }
}

/// Result of validation
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Name of validated value
    pub name: String,
    /// Whether validation passed
    pub passed: bool,
    /// Reference value
    pub expected: f32,
    /// Computed value
    pub actual: f32,
    /// Absolute difference
    pub abs_diff: f32,
    /// Error message if any
    pub error: Option<String>,
}

impl ValidationResult {
    /// Create a failing result
    pub fn fail(name: &str, error: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            expected: f32::NAN,
            actual: f32::NAN,
            abs_diff: f32::NAN,
            error: Some(error.to_string()),
        }
    }

    /// Summary string
    pub fn summary(&self) -> String {
        if let Some(ref err) = self.error {
            format!("[FAIL] {} - {}", self.name, err)
        } else if self.passed {
            format!(
                "[PASS] {} - expected={:.6}, actual={:.6}, diff={:.2e}",
                self.name, self.expected, self.actual, self.abs_diff
            )
        } else {
            format!(
                "[FAIL] {} - expected={:.6}, actual={:.6}, diff={:.2e}",
                self.name, self.expected, self.actual, self.abs_diff
            )
        }
    }
}

/// Parse reference losses given as "focal,wh,reg"
pub fn parse_reference(s: &str) -> Result<HeadLosses> {
    let values: Vec<f32> = s
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .with_context(|| format!("Invalid loss value: {:?}", v))
        })
        .collect::<Result<_>>()?;
    match values.as_slice() {
        [focal, wh, reg] => Ok(HeadLosses {
            focal: *focal,
            wh: *wh,
            reg: *reg,
        }),
        _ => anyhow::bail!(
            "Expected 3 comma-separated losses (focal,wh,reg), got {}",
            values.len()
        ),
    }
}

/// Load reference losses from a float32 `.npy` array of shape (3,)
pub fn load_reference<P: AsRef<Path>>(path: P) -> Result<HeadLosses> {
    let (data, shape) = load_npy_f32(&path)?;
    anyhow::ensure!(
        data.len() == 3,
        "Expected 3 reference losses in {:?}, got shape {:?}",
        path.as_ref(),
        shape
    );
    Ok(HeadLosses {
        focal: data[0],
        wh: data[1],
        reg: data[2],
    })
}

/// Validator for comparing computed losses to reference values
#[derive(Default)]
pub struct Validator {
    config: ValidationConfig,
    results: Vec<ValidationResult>,
}

impl Validator {
    /// Create a new validator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom config
    pub fn with_config(config: ValidationConfig) -> Self {
        Self {
            config,
            results: Vec::new(),
        }
    }

    /// Validate a single value
    pub fn check(&mut self, name: &str, expected: f32, actual: f32) -> ValidationResult {
        let result = if !actual.is_finite() {
            ValidationResult::fail(name, &format!("non-finite value {}", actual))
        } else {
            let abs_diff = (expected - actual).abs();
            let tol = self.config.atol + self.config.rtol * expected.abs();
            ValidationResult {
                name: name.to_string(),
                passed: abs_diff <= tol,
                expected,
                actual,
                abs_diff,
                error: None,
            }
        };

        if !result.passed {
            warn!("{}", result.summary());
        }
        self.results.push(result.clone());
        result
    }

    /// Validate a rank-0 loss tensor
    pub fn check_tensor(&mut self, name: &str, expected: f32, actual: &Tensor) -> Result<ValidationResult> {
        let actual = crate::utils::tensor_utils::scalar_f32(actual)?;
        Ok(self.check(name, expected, actual))
    }

    /// Validate the three unweighted head losses
    pub fn check_losses(&mut self, reference: &HeadLosses, actual: &HeadLosses) {
        self.check("focal_loss", reference.focal, actual.focal);
        self.check("wh_loss", reference.wh, actual.wh);
        self.check("reg_loss", reference.reg, actual.reg);
    }

    /// Get all validation results
    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    /// Check if all validations passed
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Print summary
    pub fn print_summary(&self) {
        println!("\n=== Validation Summary ===\n");

        let passed = self.results.iter().filter(|r| r.passed).count();
        let total = self.results.len();

        for result in &self.results {
            println!("{}", result.summary());
        }

        println!("\nTotal: {}/{} passed", passed, total);
    }

    /// Clear results
    pub fn clear(&mut self) {
        self.results.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_config_default() {
        let config = ValidationConfig::default();
        assert_eq!(config.atol, 1e-4);
        assert_eq!(config.rtol, 1e-3);
    }

    #[test]
    fn test_check_tolerance() {
        let mut validator = Validator::new();

        assert!(validator.check("same", 1.0, 1.0).passed);
        // atol 1e-4 + rtol 1e-3 * 10 = 1.01e-2
        assert!(validator.check("close", 10.0, 10.005).passed);
        assert!(!validator.check("far", 10.0, 10.1).passed);
        assert!(!validator.all_passed());
        assert_eq!(validator.results().len(), 3);

        validator.clear();
        assert!(validator.all_passed());
    }

    #[test]
    fn test_non_finite_fails() {
        let mut validator = Validator::new();
        let result = validator.check("nan", 1.0, f32::NAN);
        assert!(!result.passed);
        assert!(result.summary().starts_with("[FAIL]"));
    }

    #[test]
    fn test_parse_reference() {
        let r = parse_reference("2.5, 0.75,0.125").unwrap();
        assert_eq!(
            r,
            HeadLosses {
                focal: 2.5,
                wh: 0.75,
                reg: 0.125
            }
        );
        assert!(parse_reference("1.0,2.0").is_err());
        assert!(parse_reference("a,b,c").is_err());
    }

    #[test]
    fn test_summary_format() {
        let mut validator = Validator::new();
        let result = validator.check("focal_loss", 1.0, 1.0);
        let summary = result.summary();
        assert!(summary.contains("[PASS]"));
        assert!(summary.contains("focal_loss"));
    }
}
