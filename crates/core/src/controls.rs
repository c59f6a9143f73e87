/// Strongly typed control identifier (a V4L2 CID on the Linux backends).
///
/// # Example
/// ```rust
/// use argus_core::prelude::ControlId;
///
/// let id = ControlId(0x0098_0913); // brightness
/// assert_eq!(id.0, 0x0098_0913);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlId(pub u32);

/// Control value variants with minimal footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlValue {
    Int(i32),
    Uint(u32),
    Bool(bool),
}

impl ControlValue {
    /// Collapse to the signed integer representation device boundaries use.
    pub fn as_i64(&self) -> i64 {
        match self {
            ControlValue::Int(v) => *v as i64,
            ControlValue::Uint(v) => *v as i64,
            ControlValue::Bool(v) => *v as i64,
        }
    }
}

impl From<i32> for ControlValue {
    fn from(v: i32) -> Self {
        ControlValue::Int(v)
    }
}

impl From<u32> for ControlValue {
    fn from(v: u32) -> Self {
        ControlValue::Uint(v)
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        ControlValue::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_collapses_to_i64() {
        assert_eq!(ControlValue::Int(-3).as_i64(), -3);
        assert_eq!(ControlValue::Uint(7).as_i64(), 7);
        assert_eq!(ControlValue::Bool(true).as_i64(), 1);
    }
}
