//! Device profile database.
//!
//! Maps depth camera USB VID:PID to the pixel format to request and the
//! tilt control range to assume. Profile files are embedded at compile
//! time from `contrib/hw/*.toml`.

use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

/// Microsoft Kinect for Xbox 360.
const PROFILE_045E_02AE: &str = include_str!("../../../contrib/hw/045e-02ae.toml");
/// ASUS Xtion PRO Live.
const PROFILE_1D27_0600: &str = include_str!("../../../contrib/hw/1d27-0600.toml");

static PROFILE_DB: OnceLock<Vec<DeviceProfile>> = OnceLock::new();

/// Top-level profile file structure (one per `contrib/hw/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub device: DeviceIds,
    pub depth: DepthProfile,
    /// Absent for sensors without a motor.
    pub tilt: Option<TiltProfile>,
}

/// Camera identification fields from the `[device]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIds {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
}

/// `[depth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthProfile {
    /// FourCC to request, e.g. "Y16" or "Y10B".
    pub fourcc: String,
    /// Left shift applied to each decoded sample.
    #[serde(default)]
    pub shift: u8,
}

/// `[tilt]` section: driver control range, used when the driver
/// does not report one.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TiltProfile {
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("bad profile TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("profile shift {0} exceeds 15 bits")]
    ShiftTooLarge(u8),
}

/// Parse and sanity-check one profile file.
pub fn parse_profile(src: &str) -> Result<DeviceProfile, ProfileError> {
    let profile: DeviceProfile = toml::from_str(src)?;
    if profile.depth.shift > 15 {
        return Err(ProfileError::ShiftTooLarge(profile.depth.shift));
    }
    Ok(profile)
}

fn profile_db() -> &'static Vec<DeviceProfile> {
    PROFILE_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [PROFILE_045E_02AE, PROFILE_1D27_0600] {
            match parse_profile(src) {
                Ok(p) => db.push(p),
                Err(e) => tracing::warn!(error = %e, "skipping device profile"),
            }
        }
        db
    })
}

/// Look up a profile by USB vendor:product ID.
pub fn lookup_profile(vid: u16, pid: u16) -> Option<&'static DeviceProfile> {
    profile_db()
        .iter()
        .find(|p| p.device.vendor_id == vid && p.device.product_id == pid)
}

/// List all known profiles.
pub fn list_profiles() -> &'static [DeviceProfile] {
    profile_db()
}

/// Profile for a `/dev/videoN` node, if its USB IDs are known.
pub fn profile_for_device(device_path: &str) -> Option<&'static DeviceProfile> {
    let (vid, pid) = get_usb_ids(device_path)?;
    lookup_profile(vid, pid)
}

/// Read USB VID:PID from sysfs for a `/dev/videoN` device.
///
/// Returns `None` if the device is not USB or sysfs is unavailable.
pub fn get_usb_ids(device_path: &str) -> Option<(u16, u16)> {
    let dev_name = std::path::Path::new(device_path).file_name()?.to_str()?;
    // /sys/class/video4linux/videoN/device links to the USB interface dir;
    // its parent is the USB device dir holding idVendor/idProduct.
    let device_link = format!("/sys/class/video4linux/{dev_name}/device");
    let interface_dir = std::fs::canonicalize(&device_link).ok()?;
    let usb_device_dir = interface_dir.parent()?;

    let vid_str = std::fs::read_to_string(usb_device_dir.join("idVendor")).ok()?;
    let pid_str = std::fs::read_to_string(usb_device_dir.join("idProduct")).ok()?;

    let vid = u16::from_str_radix(vid_str.trim(), 16).ok()?;
    let pid = u16::from_str_radix(pid_str.trim(), 16).ok()?;
    Some((vid, pid))
}
