//! Body catalogs in TOML.
//!
//! Records use catalog units (km, km^3/s^2, degrees) and are converted to
//! radians and seconds on the way into a [`BodyRegistry`].

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bodies::{
        BodyId, BodyKind, BodyRegistry, CelestialBody, ExternalSourceHandle, HierarchyError,
        Positioning, RotationModel,
    },
    kepler::OrbitalElements,
    time::{TimeError, UT},
};

pub const DEFAULT_EPOCH: &str = "2025-05-11T00:00:00";
pub const DEFAULT_FRAME: &str = "ECLIPJ2000";

/// Obliquity of the ecliptic at J2000 (degrees).
const OBLIQUITY_J2000: f64 = 23.439_28;
const SECONDS_PER_DAY: f64 = 86_400.0;
const DAYS_PER_CENTURY: f64 = 36_525.0;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error("catalog frame `{0}` is not supported, expected {DEFAULT_FRAME}")]
    UnsupportedFrame(String),
    #[error("body {id}: {reason}")]
    InvalidRecord { id: i32, reason: String },
}

fn invalid(id: i32, reason: impl Into<String>) -> CatalogError {
    CatalogError::InvalidRecord {
        id,
        reason: reason.into(),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositioningKind {
    Fixed,
    Elements,
    Relative,
    Counterweight,
}

/// Canonical orbit in catalog units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrbitRecord {
    pub a: f64,
    pub e: f64,
    pub i: f64,
    pub raan: f64,
    pub argp: f64,
    pub m0: f64,
    /// Epoch of `m0`; J2000 when absent.
    #[serde(default)]
    pub epoch: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyRecord {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub kind: Option<BodyKind>,
    #[serde(default)]
    pub parent: Option<i32>,
    #[serde(default)]
    pub positioning: Option<PositioningKind>,
    /// External source handle for relative positioning; the body's own id
    /// when absent.
    #[serde(default)]
    pub source: Option<i32>,
    #[serde(default)]
    pub gm: Option<f64>,
    #[serde(default, alias = "r_eq")]
    pub radius: Option<f64>,
    #[serde(default)]
    pub soi_radius: Option<f64>,
    #[serde(default)]
    pub j2: Option<f64>,
    #[serde(default)]
    pub orbit: Option<OrbitRecord>,
    /// Pole right ascension: degrees, degrees per century.
    #[serde(default)]
    pub pole_ra: Option<Vec<f64>>,
    /// Pole declination: degrees, degrees per century.
    #[serde(default)]
    pub pole_dec: Option<Vec<f64>>,
    /// Prime meridian: degrees, degrees per day.
    #[serde(default)]
    pub pm: Option<Vec<f64>>,
    /// Fixed orientation `[w, x, y, z]`.
    #[serde(default)]
    pub orientation: Option<[f64; 4]>,
}

impl BodyRecord {
    fn positioning_kind(&self) -> PositioningKind {
        match (self.positioning, self.parent, &self.orbit) {
            (Some(kind), _, _) => kind,
            (None, None, _) => PositioningKind::Fixed,
            (None, Some(_), Some(_)) => PositioningKind::Elements,
            (None, Some(_), None) => PositioningKind::Counterweight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Default simulation start.
    #[serde(default = "default_epoch")]
    pub epoch: String,
    #[serde(default = "default_frame")]
    pub frame: String,
    #[serde(default, rename = "body")]
    pub bodies: Vec<BodyRecord>,
}

fn default_epoch() -> String {
    DEFAULT_EPOCH.to_owned()
}

fn default_frame() -> String {
    DEFAULT_FRAME.to_owned()
}

pub fn from_toml_str(s: &str) -> Result<Catalog, CatalogError> {
    Ok(toml::from_str(s)?)
}

pub fn load(path: impl AsRef<Path>) -> Result<Catalog, CatalogError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_owned(),
        source,
    })?;
    from_toml_str(&s)
}

/// The built-in solar system catalog.
pub fn default_catalog() -> Result<Catalog, CatalogError> {
    from_toml_str(include_str!("../data/solar_system.toml"))
}

impl Catalog {
    pub fn epoch(&self) -> Result<UT, CatalogError> {
        Ok(UT::from_calendar(&self.epoch)?)
    }

    pub fn into_registry(self) -> Result<BodyRegistry, CatalogError> {
        Ok(BodyRegistry::new(self.into_bodies()?)?)
    }

    /// Convert every record, filling in derived gravitational parameters and
    /// sphere of influence radii.
    pub fn into_bodies(self) -> Result<Vec<CelestialBody>, CatalogError> {
        if self.frame != DEFAULT_FRAME {
            return Err(CatalogError::UnsupportedFrame(self.frame));
        }
        let epoch = self.epoch()?;
        let gms = derived_gms(&self.bodies);

        let mut bodies = self
            .bodies
            .iter()
            .map(|record| convert(record, &gms, epoch))
            .collect::<Result<Vec<_>, _>>()?;
        fill_soi_radii(&mut bodies);
        Ok(bodies)
    }
}

/// Explicit GMs, with barycenters lacking one given the total GM of their
/// subtree.
fn derived_gms(records: &[BodyRecord]) -> HashMap<i32, f64> {
    let mut children: HashMap<i32, Vec<&BodyRecord>> = HashMap::new();
    for record in records {
        if let Some(parent) = record.parent {
            children.entry(parent).or_default().push(record);
        }
    }

    fn system_gm(
        record: &BodyRecord,
        children: &HashMap<i32, Vec<&BodyRecord>>,
        visiting: &mut HashSet<i32>,
    ) -> f64 {
        // cycles are reported by the registry
        if !visiting.insert(record.id) {
            return 0.0;
        }
        let kids: f64 = children.get(&record.id).map_or(0.0, |kids| {
            kids.iter().map(|k| system_gm(k, children, visiting)).sum()
        });
        visiting.remove(&record.id);
        match (record.gm, kind_of(record)) {
            (Some(gm), BodyKind::Barycenter) => gm,
            (None, BodyKind::Barycenter) => kids,
            (gm, _) => gm.unwrap_or(0.0) + kids,
        }
    }

    records
        .iter()
        .map(|record| {
            let gm = match (record.gm, kind_of(record)) {
                (Some(gm), _) => gm,
                (None, BodyKind::Barycenter) => system_gm(record, &children, &mut HashSet::new()),
                (None, _) => 0.0,
            };
            (record.id, gm)
        })
        .collect()
}

fn kind_of(record: &BodyRecord) -> BodyKind {
    record.kind.unwrap_or_else(|| BodyKind::from_naif(BodyId(record.id)))
}

fn convert(
    record: &BodyRecord,
    gms: &HashMap<i32, f64>,
    epoch: UT,
) -> Result<CelestialBody, CatalogError> {
    let id = BodyId(record.id);
    let elements = record.orbit.as_ref().map(|orbit| orbit.elements()).transpose()?;
    let positioning = match record.positioning_kind() {
        PositioningKind::Fixed => Positioning::Fixed,
        PositioningKind::Elements => Positioning::Absolute(
            elements.ok_or_else(|| invalid(record.id, "elements positioning needs an orbit"))?,
        ),
        PositioningKind::Relative => Positioning::Relative {
            source: ExternalSourceHandle(BodyId(record.source.unwrap_or(record.id))),
            fallback: elements,
        },
        PositioningKind::Counterweight => Positioning::Counterweight,
    };
    let gm = gms.get(&record.id).copied().unwrap_or(0.0);
    if !gm.is_finite() || gm < 0.0 {
        return Err(invalid(record.id, format!("gravitational parameter {gm} is invalid")));
    }

    Ok(CelestialBody {
        id,
        name: record.name.clone(),
        kind: kind_of(record),
        parent: record.parent.map(BodyId),
        radius: record.radius.unwrap_or(0.0),
        gm,
        soi_radius: record.soi_radius,
        j2: record.j2,
        positioning,
        rotation: rotation(record, epoch)?,
    })
}

impl OrbitRecord {
    fn elements(&self) -> Result<OrbitalElements, CatalogError> {
        let epoch = match &self.epoch {
            Some(epoch) => UT::from_calendar(epoch)?,
            None => UT::J2000,
        };
        Ok(OrbitalElements {
            a: self.a,
            e: self.e,
            i: self.i.to_radians(),
            lan: self.raan.to_radians(),
            argpe: self.argp.to_radians(),
            ma: self.m0.to_radians(),
            epoch,
        })
    }
}

/// Rotation from IAU pole and prime-meridian data when present, otherwise
/// from a fixed orientation quaternion.
fn rotation(record: &BodyRecord, epoch: UT) -> Result<RotationModel, CatalogError> {
    let fixed = match record.orientation {
        Some([w, x, y, z]) => UnitQuaternion::try_new(Quaternion::new(w, x, y, z), 1e-12)
            .ok_or_else(|| invalid(record.id, "orientation quaternion is zero"))?,
        None => UnitQuaternion::identity(),
    };
    let term = |poly: &Option<Vec<f64>>, n: usize| {
        poly.as_ref().and_then(|p| p.get(n)).copied().unwrap_or(0.0)
    };

    let pole = match (&record.pole_ra, &record.pole_dec) {
        (Some(_), Some(_)) => {
            let centuries = epoch.as_days_f64() / DAYS_PER_CENTURY;
            let ra = term(&record.pole_ra, 0) + term(&record.pole_ra, 1) * centuries;
            let dec = term(&record.pole_dec, 0) + term(&record.pole_dec, 1) * centuries;
            pole_from_iau(ra, dec)
        }
        _ => fixed,
    };

    let Some(pm) = &record.pm else {
        return Ok(RotationModel {
            pole,
            ..RotationModel::default()
        });
    };
    let rate = term(&record.pm, 1);
    Ok(RotationModel {
        period: (rate != 0.0).then(|| 360.0 / rate * SECONDS_PER_DAY),
        offset: pm.first().copied().unwrap_or(0.0).to_radians(),
        epoch: UT::J2000,
        pole,
    })
}

/// Spin-axis frame to ecliptic axes for a pole at right ascension `ra` and
/// declination `dec` (degrees, equatorial J2000). The frame's x axis is the
/// ascending node of the body's equator, where the prime meridian angle is
/// measured from.
pub fn pole_from_iau(ra: f64, dec: f64) -> UnitQuaternion<f64> {
    let ecl_from_eq =
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -OBLIQUITY_J2000.to_radians());
    let node = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), (ra + 90.0).to_radians());
    let tilt = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), (90.0 - dec).to_radians());
    ecl_from_eq * node * tilt
}

/// Laplace radius `a·(GM/GM_parent)^(2/5)` for bodies on elements; dominant
/// counterweight bodies share their parent's sphere.
fn fill_soi_radii(bodies: &mut [CelestialBody]) {
    let gms: HashMap<BodyId, f64> = bodies.iter().map(|b| (b.id, b.gm)).collect();
    for body in bodies.iter_mut() {
        if body.soi_radius.is_some() {
            continue;
        }
        let (Some(elements), Some(parent)) = (body.elements(), body.parent) else {
            continue;
        };
        let parent_gm = gms.get(&parent).copied().unwrap_or(0.0);
        if body.gm > 0.0 && parent_gm > 0.0 {
            body.soi_radius = Some(elements.a * (body.gm / parent_gm).powf(0.4));
        }
    }

    let sois: HashMap<BodyId, Option<f64>> = bodies.iter().map(|b| (b.id, b.soi_radius)).collect();
    for body in bodies.iter_mut() {
        if body.soi_radius.is_none() && body.positioning == Positioning::Counterweight {
            body.soi_radius = body.parent.and_then(|p| sois.get(&p).copied().flatten());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
        [[body]]
        id = 0
        name = "Barycenter"

        [[body]]
        id = 10
        name = "Star"
        parent = 0
        gm = 1000.0

        [[body]]
        id = 3
        name = "Pair"
        parent = 0
        orbit = { a = 1.0e6, e = 0.1, i = 0.0, raan = 0.0, argp = 90.0, m0 = 180.0 }

        [[body]]
        id = 399
        name = "Planet"
        parent = 3
        gm = 10.0
        pm = [90.0, 360.0]

        [[body]]
        id = 301
        name = "Satellite"
        parent = 3
        gm = 0.1
        positioning = "relative"
        orbit = { a = 1.0e3, e = 0.0, i = 0.0, raan = 0.0, argp = 0.0, m0 = 0.0 }
    "#;

    #[test]
    fn small_catalog_converts() {
        let catalog = from_toml_str(SMALL).unwrap();
        assert_eq!(catalog.epoch, DEFAULT_EPOCH);
        let registry = catalog.into_registry().unwrap();

        // barycenters total their subtree
        assert!((registry.body(BodyId(3)).unwrap().gm - 10.1).abs() < 1e-12);
        assert!((registry.body(BodyId(0)).unwrap().gm - 1010.1).abs() < 1e-9);

        let pair = registry.body(BodyId(3)).unwrap();
        assert_eq!(pair.kind, BodyKind::Barycenter);
        let Positioning::Absolute(elements) = &pair.positioning else {
            panic!("barycenter with an orbit is on elements");
        };
        assert!((elements.argpe - std::f64::consts::FRAC_PI_2).abs() < 1e-15);
        let soi = pair.soi_radius.unwrap();
        assert!((soi - 1.0e6 * (10.1_f64 / 1010.1).powf(0.4)).abs() < 1e-6);

        let planet = registry.body(BodyId(399)).unwrap();
        assert_eq!(planet.positioning, Positioning::Counterweight);
        assert_eq!(planet.soi_radius, Some(soi));
        assert_eq!(planet.rotation.period, Some(SECONDS_PER_DAY));
        assert!((planet.rotation.offset - std::f64::consts::FRAC_PI_2).abs() < 1e-15);

        let satellite = registry.body(BodyId(301)).unwrap();
        assert!(matches!(
            satellite.positioning,
            Positioning::Relative {
                source: ExternalSourceHandle(BodyId(301)),
                fallback: Some(_)
            }
        ));
    }

    #[test]
    fn malformed_catalogs_are_rejected() {
        assert!(matches!(
            from_toml_str("[[body]]\nname = 3"),
            Err(CatalogError::Parse(_))
        ));
        let wrong_frame = Catalog {
            frame: "J2000".into(),
            ..from_toml_str(SMALL).unwrap()
        };
        assert!(matches!(
            wrong_frame.into_registry(),
            Err(CatalogError::UnsupportedFrame(_))
        ));
        let orphan = from_toml_str(
            r#"
            [[body]]
            id = 0
            name = "a"
            [[body]]
            id = 1
            name = "b"
            parent = 5
            "#,
        )
        .unwrap();
        assert!(matches!(
            orphan.into_registry(),
            Err(CatalogError::Hierarchy(HierarchyError::MissingParent { .. }))
        ));
        let no_orbit = from_toml_str(
            r#"
            [[body]]
            id = 0
            name = "a"
            [[body]]
            id = 1
            name = "b"
            parent = 0
            positioning = "elements"
            "#,
        )
        .unwrap();
        assert!(matches!(
            no_orbit.into_registry(),
            Err(CatalogError::InvalidRecord { id: 1, .. })
        ));
    }

    #[test]
    fn iau_pole_of_earth_is_tilted_by_the_obliquity() {
        let pole = pole_from_iau(0.0, 90.0) * Vector3::z();
        let tilt = pole.angle(&Vector3::z());
        assert!((tilt - OBLIQUITY_J2000.to_radians()).abs() < 1e-12);
        assert!(pole.y > 0.0);
    }
}
