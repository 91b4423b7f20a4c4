//! Device class to reading type mapping and unit normalization.
//!
//! Supporting a new sensor class means adding a row to [`DEVICE_CLASSES`].

/// Reading type and canonical unit for a device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingKind {
    pub reading_type: &'static str,
    pub unit: &'static str,
}

const fn kind(reading_type: &'static str, unit: &'static str) -> ReadingKind {
    ReadingKind { reading_type, unit }
}

/// Upstream device class -> reading type and canonical unit.
pub const DEVICE_CLASSES: &[(&str, ReadingKind)] = &[
    // Environmental
    ("temperature", kind("temperature", "°C")),
    ("humidity", kind("humidity", "%")),
    ("moisture", kind("moisture", "%")),
    ("pressure", kind("pressure", "hPa")),
    ("atmospheric_pressure", kind("pressure", "hPa")),
    // Air quality
    ("carbon_dioxide", kind("co2", "ppm")),
    ("carbon_monoxide", kind("co", "ppm")),
    ("pm1", kind("pm1_0", "µg/m³")),
    ("pm25", kind("pm2_5", "µg/m³")),
    ("pm10", kind("pm10", "µg/m³")),
    ("volatile_organic_compounds", kind("voc", "index")),
    ("volatile_organic_compounds_parts", kind("voc", "index")),
    ("nitrogen_dioxide", kind("no2", "ppb")),
    ("ozone", kind("o3", "ppb")),
    ("sulphur_dioxide", kind("so2", "ppb")),
    ("aqi", kind("aqi", "index")),
    // Light
    ("illuminance", kind("light_level", "lux")),
    ("irradiance", kind("irradiance", "W/m²")),
    ("uv_index", kind("uv_index", "index")),
    // Power
    ("battery", kind("battery_level", "%")),
    ("voltage", kind("voltage", "V")),
    ("current", kind("current", "A")),
    ("power", kind("power", "W")),
    ("energy", kind("energy", "kWh")),
    // Sound
    ("sound_pressure", kind("sound_level", "dB")),
    // Weather
    ("wind_speed", kind("wind_speed", "m/s")),
    ("speed", kind("speed", "m/s")),
    ("precipitation", kind("precipitation", "mm")),
    ("precipitation_intensity", kind("precipitation_intensity", "mm/h")),
    // Other
    ("signal_strength", kind("rssi", "dBm")),
    ("distance", kind("distance", "m")),
];

/// Keywords in an entity id that identify a reading type. Checked in order.
const ID_KEYWORDS: &[(&str, &str)] = &[
    ("temperature", "temperature"),
    ("temp", "temperature"),
    ("humidity", "humidity"),
    ("pressure", "pressure"),
    ("carbon_dioxide", "co2"),
    ("co2", "co2"),
    ("pm2_5", "pm2_5"),
    ("pm25", "pm2_5"),
    ("pm10", "pm10"),
    ("pm1", "pm1_0"),
    ("voc", "voc"),
    ("illuminance", "light_level"),
    ("lux", "light_level"),
    ("battery", "battery_level"),
    ("voltage", "voltage"),
    ("power", "power"),
    ("energy", "energy"),
];

/// Declared units that identify a reading type on their own.
const UNIT_HINTS: &[(&str, &str)] = &[
    ("°c", "temperature"),
    ("°f", "temperature"),
    ("hpa", "pressure"),
    ("mbar", "pressure"),
    ("ppm", "co2"),
    ("lux", "light_level"),
    ("lx", "light_level"),
    ("v", "voltage"),
    ("w", "power"),
    ("kwh", "energy"),
    ("dbm", "rssi"),
];

type Conversion = fn(f64) -> f64;

/// (from, to) -> conversion into the canonical unit.
const CONVERSIONS: &[(&str, &str, Conversion)] = &[
    // Temperature
    ("°F", "°C", |x| (x - 32.0) * 5.0 / 9.0),
    ("K", "°C", |x| x - 273.15),
    // Pressure
    ("mbar", "hPa", |x| x),
    ("Pa", "hPa", |x| x / 100.0),
    ("kPa", "hPa", |x| x * 10.0),
    ("inHg", "hPa", |x| x * 33.8639),
    ("mmHg", "hPa", |x| x * 1.33322),
    ("psi", "hPa", |x| x * 68.9476),
    // Energy and power
    ("Wh", "kWh", |x| x / 1000.0),
    ("MWh", "kWh", |x| x * 1000.0),
    ("kW", "W", |x| x * 1000.0),
    ("mV", "V", |x| x / 1000.0),
    ("mA", "A", |x| x / 1000.0),
    // Distance
    ("cm", "m", |x| x / 100.0),
    ("mm", "m", |x| x / 1000.0),
    ("km", "m", |x| x * 1000.0),
    ("ft", "m", |x| x * 0.3048),
    ("in", "m", |x| x * 0.0254),
    ("mi", "m", |x| x * 1609.34),
    // Precipitation
    ("in", "mm", |x| x * 25.4),
    ("in/h", "mm/h", |x| x * 25.4),
    // Speed
    ("km/h", "m/s", |x| x / 3.6),
    ("mph", "m/s", |x| x * 0.44704),
    ("kn", "m/s", |x| x * 0.514444),
    ("ft/s", "m/s", |x| x * 0.3048),
];

/// Reading type and canonical unit for an upstream device class.
pub fn for_device_class(device_class: &str) -> Option<ReadingKind> {
    let device_class = device_class.to_ascii_lowercase();
    DEVICE_CLASSES
        .iter()
        .find(|(class, _)| *class == device_class)
        .map(|(_, kind)| *kind)
}

/// Canonical unit for a reading type.
pub fn canonical_unit(reading_type: &str) -> Option<&'static str> {
    DEVICE_CLASSES
        .iter()
        .find(|(_, kind)| kind.reading_type == reading_type)
        .map(|(_, kind)| kind.unit)
}

/// Guess the reading type of an entity with no device class.
pub fn infer(entity_id: &str, unit: Option<&str>) -> Option<ReadingKind> {
    let lower_id = entity_id.to_ascii_lowercase();
    let from_id = ID_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower_id.contains(keyword))
        .map(|(_, reading_type)| *reading_type);

    let reading_type = from_id.or_else(|| {
        let unit = unit?.to_lowercase();
        UNIT_HINTS
            .iter()
            .find(|(hint, _)| *hint == unit)
            .map(|(_, reading_type)| *reading_type)
    })?;

    canonical_unit(reading_type).map(|unit| kind(reading_type, unit))
}

/// Convert `value` from `from` into `to`, if a conversion is known.
pub fn convert(value: f64, from: &str, to: &str) -> Option<f64> {
    if from == to {
        return Some(value);
    }
    CONVERSIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, conversion)| conversion(value))
}

/// Round to four decimal places.
///
/// Values too large to scale already carry no fractional digits and are
/// returned as they are.
pub fn round_value(value: f64) -> f64 {
    let scaled = value * 10_000.0;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / 10_000.0
}
