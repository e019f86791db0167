//! Tolerance constants for plugin tests.

/// Floating point rounding errors (for passthrough, exact gain).
pub const FLOAT_EPSILON: f32 = 1e-6;

/// A plugin storing parameters at 16-bit resolution.
pub const PARAM_EPSILON: f32 = 1.0 / 65536.0;
