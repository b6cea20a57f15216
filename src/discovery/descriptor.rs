use crate::identity::{dotted, MidiIdentity};
use std::fmt;

/// Snapshot of one serial port taken during a discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_path: String,
    pub usb_vendor_id: Option<u16>,
    pub usb_product_id: Option<u16>,
    pub usb_location: Option<String>,
    pub usb_manufacturer: Option<String>,
    pub usb_description: Option<String>,
    pub usb_serial_number: Option<String>,
    pub is_exclusive_available: bool,
    pub identity: Option<MidiIdentity>,
}

impl DeviceDescriptor {
    /// Descriptor carrying only a path, as reported by ports without USB metadata.
    pub fn bare(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            usb_vendor_id: None,
            usb_product_id: None,
            usb_location: None,
            usb_manufacturer: None,
            usb_description: None,
            usb_serial_number: None,
            is_exclusive_available: false,
            identity: None,
        }
    }

    /// Every field as `(name, rendered value)`, identity fields flattened.
    pub fn flattened(&self) -> Vec<(&'static str, String)> {
        Field::ALL
            .iter()
            .map(|field| (field.name(), field.render(self)))
            .collect()
    }
}

/// Typed value of a descriptor field. `None` inside a variant means absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(Option<String>),
    Number(Option<u32>),
    Flag(bool),
    Bytes(Option<Vec<u8>>),
}

impl FieldValue {
    pub fn is_present(&self) -> bool {
        match self {
            FieldValue::Text(v) => v.is_some(),
            FieldValue::Number(v) => v.is_some(),
            FieldValue::Flag(_) => true,
            FieldValue::Bytes(v) => v.is_some(),
        }
    }
}

/// Read-only view over the fields of a [`DeviceDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    DevicePath,
    UsbVendorId,
    UsbProductId,
    UsbLocation,
    UsbManufacturer,
    UsbDescription,
    UsbSerialNumber,
    ExclusiveAvailable,
    ManufacturerId,
    FamilyCode,
    ModelNumber,
    Version,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::DevicePath,
        Field::UsbVendorId,
        Field::UsbProductId,
        Field::UsbLocation,
        Field::UsbManufacturer,
        Field::UsbDescription,
        Field::UsbSerialNumber,
        Field::ExclusiveAvailable,
        Field::ManufacturerId,
        Field::FamilyCode,
        Field::ModelNumber,
        Field::Version,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::DevicePath => "device_path",
            Field::UsbVendorId => "usb_vendor_id",
            Field::UsbProductId => "usb_product_id",
            Field::UsbLocation => "usb_location",
            Field::UsbManufacturer => "usb_manufacturer",
            Field::UsbDescription => "usb_description",
            Field::UsbSerialNumber => "usb_serial_number",
            Field::ExclusiveAvailable => "is_exclusive_available",
            Field::ManufacturerId => "identity.manufacturer_id",
            Field::FamilyCode => "identity.family_code",
            Field::ModelNumber => "identity.model_number",
            Field::Version => "identity.version",
        }
    }

    /// Resolves a field name, accepting the short aliases used on the command line.
    pub fn lookup(name: &str) -> Option<Field> {
        let name = name
            .strip_prefix("device_info.")
            .unwrap_or(name)
            .replace("midi_identity.", "identity.");
        let field = match name.as_str() {
            "device_path" => Field::DevicePath,
            "usb_vendor_id" | "usb_vid" => Field::UsbVendorId,
            "usb_product_id" | "usb_pid" => Field::UsbProductId,
            "usb_location" => Field::UsbLocation,
            "usb_manufacturer" => Field::UsbManufacturer,
            "usb_description" => Field::UsbDescription,
            "usb_serial_number" => Field::UsbSerialNumber,
            "is_exclusive_available" | "exclusive" => Field::ExclusiveAvailable,
            "identity.manufacturer_id" | "identity.manufacturer" => Field::ManufacturerId,
            "identity.family_code" => Field::FamilyCode,
            "identity.model_number" => Field::ModelNumber,
            "identity.version" => Field::Version,
            _ => return None,
        };
        Some(field)
    }

    pub fn value_of(&self, d: &DeviceDescriptor) -> FieldValue {
        match self {
            Field::DevicePath => FieldValue::Text(Some(d.device_path.clone())),
            Field::UsbVendorId => FieldValue::Number(d.usb_vendor_id.map(u32::from)),
            Field::UsbProductId => FieldValue::Number(d.usb_product_id.map(u32::from)),
            Field::UsbLocation => FieldValue::Text(d.usb_location.clone()),
            Field::UsbManufacturer => FieldValue::Text(d.usb_manufacturer.clone()),
            Field::UsbDescription => FieldValue::Text(d.usb_description.clone()),
            Field::UsbSerialNumber => FieldValue::Text(d.usb_serial_number.clone()),
            Field::ExclusiveAvailable => FieldValue::Flag(d.is_exclusive_available),
            Field::ManufacturerId => {
                FieldValue::Number(d.identity.map(|i| u32::from(i.manufacturer_id)))
            }
            Field::FamilyCode => FieldValue::Bytes(d.identity.map(|i| i.family_code.to_vec())),
            Field::ModelNumber => FieldValue::Bytes(d.identity.map(|i| i.model_number.to_vec())),
            Field::Version => FieldValue::Bytes(d.identity.map(|i| i.version.to_vec())),
        }
    }

    /// Human readable rendering used by the device listing.
    pub fn render(&self, d: &DeviceDescriptor) -> String {
        let rendered = match (self, self.value_of(d)) {
            (Field::UsbVendorId | Field::UsbProductId, FieldValue::Number(Some(n))) => {
                Some(format!("0x{:04x}", n))
            }
            (Field::ManufacturerId, FieldValue::Number(Some(n))) => Some(format!("0x{:02x}", n)),
            (_, FieldValue::Number(n)) => n.map(|n| n.to_string()),
            (_, FieldValue::Text(t)) => t,
            (_, FieldValue::Flag(b)) => Some(b.to_string()),
            (_, FieldValue::Bytes(b)) => b.map(|b| dotted(&b)),
        };
        rendered.unwrap_or_else(|| "None".to_string())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
