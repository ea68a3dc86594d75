#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u16)]
pub enum ControllerError {
    AlreadyClaimed = 0x1001,
    InsufficientBandwidth = 0x1002,
    MissingClaim = 0x1003,
}

impl ToString for ControllerError {
    fn to_string(&self) -> String {
        format!("{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::ControllerError;

    #[test]
    fn codes_round_trip() {
        for err in [ControllerError::AlreadyClaimed, ControllerError::InsufficientBandwidth, ControllerError::MissingClaim] {
            let code: u16 = err.into();
            assert_eq!(ControllerError::try_from(code).expect("known code"), err);
        }
    }

    #[test]
    fn to_string_is_variant_name() {
        assert_eq!(ControllerError::AlreadyClaimed.to_string(), "AlreadyClaimed");
    }
}
