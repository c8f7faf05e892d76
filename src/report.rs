//! Narrative reports for saved violations.
//!
//! The pipeline looks up owner metadata through a `VehicleLookup` and hands
//! it, together with the violation figures, to a `ReportGenerator`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Registry entry for a plate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub vehicle_type: String,
    #[serde(default = "default_registered")]
    pub registered: bool,
}

fn default_registered() -> bool {
    true
}

pub trait VehicleLookup: Send {
    /// `None` means the plate is not in the registry.
    fn lookup(&self, plate: &str) -> Option<VehicleInfo>;
}

/// Everything a generator may use to explain one violation.
#[derive(Clone, Debug, Serialize)]
pub struct ReportRequest<'a> {
    pub plate: &'a str,
    pub speed: f64,
    pub speed_limit: f64,
    pub vehicle: Option<&'a VehicleInfo>,
}

impl ReportRequest<'_> {
    pub fn exceed_speed(&self) -> f64 {
        self.speed - self.speed_limit
    }
}

pub trait ReportGenerator: Send {
    fn name(&self) -> &'static str;

    fn explain(&self, request: &ReportRequest<'_>) -> Result<String>;
}

/// Narrative used in place of a report that could not be generated.
pub fn placeholder_report(plate: &str, error: &anyhow::Error) -> String {
    format!("report unavailable for plate {}: {}", plate, error)
}

// -------------------- Static registry --------------------

/// In-memory plate registry, typically loaded from a JSON object keyed by plate.
#[derive(Clone, Debug, Default)]
pub struct StaticVehicleLookup {
    vehicles: HashMap<String, VehicleInfo>,
}

impl StaticVehicleLookup {
    pub fn new(vehicles: HashMap<String, VehicleInfo>) -> Self {
        let vehicles = vehicles
            .into_iter()
            .map(|(plate, info)| (normalize_plate(&plate), info))
            .collect();
        Self { vehicles }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read vehicle registry {}: {}", path.display(), e))?;
        let vehicles: HashMap<String, VehicleInfo> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid vehicle registry {}: {}", path.display(), e))?;
        Ok(Self::new(vehicles))
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}

impl VehicleLookup for StaticVehicleLookup {
    fn lookup(&self, plate: &str) -> Option<VehicleInfo> {
        self.vehicles.get(&normalize_plate(plate)).cloned()
    }
}

fn normalize_plate(plate: &str) -> String {
    plate.trim().to_uppercase()
}

// -------------------- Template generator --------------------

/// Deterministic narrative built from the violation figures alone.
#[derive(Clone, Debug, Default)]
pub struct TemplateReportGenerator;

impl ReportGenerator for TemplateReportGenerator {
    fn name(&self) -> &'static str {
        "template"
    }

    fn explain(&self, request: &ReportRequest<'_>) -> Result<String> {
        let mut out = format!(
            "Vehicle {} was measured at {:.2} km/h in a {:.0} km/h zone, exceeding the limit by {:.2} km/h.",
            request.plate,
            request.speed,
            request.speed_limit,
            request.exceed_speed()
        );
        match request.vehicle {
            Some(v) if v.registered => out.push_str(&format!(
                " Registered {} owned by {} (id {}).",
                v.vehicle_type, v.owner, v.id
            )),
            Some(v) => out.push_str(&format!(
                " The {} is listed for {} but its registration is not valid.",
                v.vehicle_type, v.owner
            )),
            None => out.push_str(" The plate was not found in the vehicle registry."),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REGISTRY: &str = r#"{
        "30A-123.45": {"id": "00130405771", "owner": "Ng Ngoc Linh", "phone": "0905123456",
                        "address": "123 Duong Hoa", "vehicle_type": "car", "registered": true},
        "29b-678.90": {"id": "001304021054", "owner": "Nhanntt", "vehicle_type": "motorbike"}
    }"#;

    #[test]
    fn registry_lookup_normalizes_plates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY.as_bytes()).unwrap();
        let lookup = StaticVehicleLookup::from_json_file(file.path()).unwrap();

        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup.lookup("30a-123.45").unwrap().owner, "Ng Ngoc Linh");
        let bike = lookup.lookup(" 29B-678.90 ").unwrap();
        assert!(bike.registered);
        assert!(bike.phone.is_none());
        assert!(lookup.lookup("51F-000.00").is_none());
    }

    #[test]
    fn template_mentions_figures_and_owner() {
        let vehicle = VehicleInfo {
            id: "00130405771".into(),
            owner: "Ng Ngoc Linh".into(),
            phone: None,
            address: None,
            vehicle_type: "car".into(),
            registered: true,
        };
        let text = TemplateReportGenerator
            .explain(&ReportRequest {
                plate: "30A-123.45",
                speed: 82.5,
                speed_limit: 60.0,
                vehicle: Some(&vehicle),
            })
            .unwrap();
        assert!(text.contains("30A-123.45"));
        assert!(text.contains("82.50 km/h"));
        assert!(text.contains("22.50 km/h"));
        assert!(text.contains("Ng Ngoc Linh"));
    }

    #[test]
    fn template_handles_unknown_vehicle() {
        let text = TemplateReportGenerator
            .explain(&ReportRequest {
                plate: "51F-000.00",
                speed: 70.0,
                speed_limit: 60.0,
                vehicle: None,
            })
            .unwrap();
        assert!(text.contains("not found"));
    }
}
