//! Luhn checksum for order numbers and withdrawal references.

/// Returns `true` when `number` is a non-empty string of ASCII digits that
/// passes the Luhn checksum.
pub fn is_valid(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (position, byte) in number.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return false;
        }
        let digit = u32::from(byte - b'0');
        sum = (sum + weigh(digit, position % 2 == 1)) % 10;
    }
    sum == 0
}

/// Computes the digit that makes `payload` followed by it a valid number.
///
/// Returns `None` if `payload` contains anything but ASCII digits.
pub fn check_digit(payload: &str) -> Option<u8> {
    let mut sum = 0u32;
    // once the check digit is appended, the rightmost payload digit is doubled
    for (position, byte) in payload.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return None;
        }
        let digit = u32::from(byte - b'0');
        sum = (sum + weigh(digit, position % 2 == 0)) % 10;
    }
    Some(((10 - sum) % 10) as u8)
}

fn weigh(digit: u32, doubled: bool) -> u32 {
    if !doubled {
        return digit;
    }
    let doubled = digit * 2;
    if doubled > 9 { doubled - 9 } else { doubled }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_numbers() {
        for number in ["12345678903", "9278923470", "2377225624", "346436439", "79927398713", "0", "18"] {
            assert!(is_valid(number), "{number} should be valid");
        }
        for number in ["12345678902", "9278923471", "1", "79927398710"] {
            assert!(!is_valid(number), "{number} should be invalid");
        }
    }

    #[test]
    fn test_rejects_non_digits() {
        assert!(!is_valid(""));
        assert!(!is_valid("1234 5678 903"));
        assert!(!is_valid("12345678903a"));
        assert!(!is_valid("-18"));
        assert!(!is_valid("١٨"));
    }

    #[test]
    fn test_check_digit() {
        assert_eq!(check_digit("1234567890"), Some(3));
        assert_eq!(check_digit("927892347"), Some(0));
        assert_eq!(check_digit(""), Some(0));
        assert_eq!(check_digit("12a"), None);
    }

    proptest! {
        #[test]
        fn completed_payload_is_valid(payload in "[0-9]{0,24}") {
            let digit = check_digit(&payload).unwrap();
            let number = format!("{payload}{digit}");
            prop_assert!(is_valid(&number));
        }

        #[test]
        fn changing_any_single_digit_invalidates(
            payload in "[0-9]{1,24}",
            position in any::<prop::sample::Index>(),
            delta in 1u8..10,
        ) {
            let digit = check_digit(&payload).unwrap();
            let mut digits = format!("{payload}{digit}").into_bytes();
            let at = position.index(digits.len());
            digits[at] = b'0' + (digits[at] - b'0' + delta) % 10;
            let number = String::from_utf8(digits).unwrap();
            prop_assert!(!is_valid(&number));
        }

        #[test]
        fn any_non_digit_is_rejected(prefix in "[0-9]{0,8}", bad in "[^0-9]", suffix in "[0-9]{0,8}") {
            let number = format!("{prefix}{bad}{suffix}");
            prop_assert!(!is_valid(&number));
        }
    }
}
