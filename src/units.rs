//! Unit system and physical constants.
//!
//! Internal units: millimetre, nanosecond, MeV, positron charge.
//! Field values are expressed in the derived unit where 1 tesla = 0.001.

/// Millimetre (base length unit)
pub const MM: f64 = 1.0;
/// Centimetre
pub const CM: f64 = 10.0 * MM;
/// Metre
pub const METER: f64 = 1000.0 * MM;

/// Nanosecond (base time unit)
pub const NS: f64 = 1.0;

/// MeV (base energy unit)
pub const MEV: f64 = 1.0;
/// GeV
pub const GEV: f64 = 1000.0 * MEV;

/// Tesla in internal units (MeV·ns / (e+·mm²))
pub const TESLA: f64 = 0.001;

/// Speed of light in mm/ns
pub const C_LIGHT: f64 = 299.792458 * MM / NS;

/// Proton rest energy in MeV
pub const PROTON_MASS_C2: f64 = 938.272013 * MEV;

/// Electron rest energy in MeV
pub const ELECTRON_MASS_C2: f64 = 0.510998910 * MEV;
