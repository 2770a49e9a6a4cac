use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of capacity: requested {requested} blocks, available {available}")]
    OutOfCapacity { requested: usize, available: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_out_of_capacity() {
        let e = CacheError::OutOfCapacity {
            requested: 4,
            available: 1,
        };
        assert_eq!(
            e.to_string(),
            "out of capacity: requested 4 blocks, available 1"
        );
    }

    #[test]
    fn error_display_invalid_argument() {
        let e = CacheError::InvalidArgument("sequence slot 9 already occupied".into());
        assert_eq!(
            e.to_string(),
            "invalid argument: sequence slot 9 already occupied"
        );
    }

    #[test]
    fn error_display_illegal_state() {
        let e = CacheError::IllegalState("no sequence at slot 3".into());
        assert_eq!(e.to_string(), "illegal state: no sequence at slot 3");
    }
}
