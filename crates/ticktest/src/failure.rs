use std::fmt;

/// A failure raised by user test code.
///
/// Any `std::error::Error` converts into a `TestFailure`, so test bodies can use
/// `?` on fallible calls. Panics raised inside test code are recorded the same
/// way, using the panic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    message: String,
}

impl TestFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for TestFailure {
    fn from(error: E) -> Self {
        Self::new(error.to_string())
    }
}

pub type TestOutcome = Result<(), TestFailure>;

/// Return types accepted from test bodies and hooks.
pub trait IntoTestOutcome {
    fn into_outcome(self) -> TestOutcome;
}

impl IntoTestOutcome for () {
    fn into_outcome(self) -> TestOutcome {
        Ok(())
    }
}

impl IntoTestOutcome for TestOutcome {
    fn into_outcome(self) -> TestOutcome {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_number(raw: &str) -> Result<u32, TestFailure> {
        Ok(raw.parse::<u32>()?)
    }

    #[test]
    fn std_errors_convert_with_question_mark() {
        let failure = parse_number("abc").expect_err("should fail");
        assert_eq!(failure.message(), "invalid digit found in string");
        assert_eq!(parse_number("12").expect("parse"), 12);
    }

    #[test]
    fn unit_and_result_are_outcomes() {
        assert_eq!(().into_outcome(), Ok(()));
        let failed: TestOutcome = Err(TestFailure::new("boom"));
        assert_eq!(failed.into_outcome().expect_err("err").to_string(), "boom");
    }
}
