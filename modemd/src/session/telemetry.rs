use super::{ModemProperties, PropertyUpdate};

/// Used as the group identity when the modem reports neither IMSI nor serial.
const NO_IDENT: &str = "noIdentGiven";

/// How much of the published network record has to be refreshed after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    None,
    Strength,
    Full,
}

/// Last known radio state of a modem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub imsi: Option<String>,
    pub serial: Option<String>,
    pub operator_name: Option<String>,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    pub access_tech: Option<String>,
    pub quality: Option<f64>,
    /// Signal strength in percent, derived from `quality`.
    pub strength: u8,
    pub roaming: bool,
    pub online: bool,
}

impl Telemetry {
    pub fn apply_properties(&mut self, props: ModemProperties) {
        self.imsi = props.imsi;
        self.serial = props.serial;
        self.operator_name = props.operator_name;
        self.mcc = props.mcc;
        self.mnc = props.mnc;
        self.access_tech = props.access_tech;
        self.quality = props.quality;
        self.strength = props.quality.map(strength_from_quality).unwrap_or(0);
        self.roaming = props.roaming;
        self.online = props.online;
    }

    pub fn apply(&mut self, update: PropertyUpdate) -> Refresh {
        fn replace<T: PartialEq>(slot: &mut T, value: T) -> Refresh {
            if *slot == value {
                return Refresh::None;
            }

            *slot = value;
            Refresh::Full
        }

        match update {
            PropertyUpdate::Quality(metric) => {
                self.quality = Some(metric);
                let strength = strength_from_quality(metric);
                if strength == self.strength {
                    Refresh::None
                } else {
                    self.strength = strength;
                    Refresh::Strength
                }
            }

            PropertyUpdate::Roaming(roaming) => replace(&mut self.roaming, roaming),
            PropertyUpdate::OperatorName(name) => replace(&mut self.operator_name, name),
            PropertyUpdate::Mcc(mcc) => replace(&mut self.mcc, mcc),
            PropertyUpdate::Mnc(mnc) => replace(&mut self.mnc, mnc),
            PropertyUpdate::AccessTech(rat) => replace(&mut self.access_tech, rat),
            PropertyUpdate::Imsi(imsi) => replace(&mut self.imsi, imsi),
            PropertyUpdate::Serial(serial) => replace(&mut self.serial, serial),
        }
    }

    pub fn display_name(&self) -> String {
        display_name(
            self.operator_name.as_deref(),
            self.mcc.as_deref(),
            self.mnc.as_deref(),
            self.access_tech.as_deref(),
        )
    }

    pub fn group(&self) -> String {
        group_ident(self.imsi.as_deref(), self.serial.as_deref())
    }
}

/// Maps a raw quality metric onto a 0..=100 strength.
///
/// A metric of exactly `0.0` means "no reading" and maps to 0. Otherwise the
/// `[-20, -3]` dB range is scaled linearly and clamped.
pub fn strength_from_quality(metric: f64) -> u8 {
    if metric == 0.0 || metric.is_nan() {
        return 0;
    }

    let scaled = ((metric + 20.0) * 100.0 / 17.0).round();

    scaled.clamp(0.0, 100.0) as u8
}

/// Operator name if known, else `mcc` + `mnc`, followed by the access technology.
pub fn display_name(
    operator: Option<&str>,
    mcc: Option<&str>,
    mnc: Option<&str>,
    access_tech: Option<&str>,
) -> String {
    let mut name = match operator.filter(|o| !o.is_empty()) {
        Some(operator) => operator.to_string(),
        None => format!("{}{}", mcc.unwrap_or_default(), mnc.unwrap_or_default()),
    };

    if let Some(rat) = access_tech.filter(|r| !r.is_empty()) {
        if !name.is_empty() {
            name.push(' ');
        }
        name.push('(');
        name.push_str(rat);
        name.push(')');
    }

    name
}

/// Service group of a cellular network: `<ident>_none`.
///
/// The ident is the IMSI, else the serial. Characters outside `[A-Za-z0-9_]` are
/// replaced by their lowercase hex byte values.
pub fn group_ident(imsi: Option<&str>, serial: Option<&str>) -> String {
    let ident = imsi
        .filter(|i| !i.is_empty())
        .or(serial.filter(|s| !s.is_empty()))
        .unwrap_or(NO_IDENT);

    let mut encoded = String::with_capacity(ident.len());
    for byte in ident.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&hex::encode([byte]));
        }
    }

    format!("{encoded}_none")
}
