use serde_json::Value;

/// Extract a structured analysis object from streamed model text.
///
/// The model interleaves prose with an occasional JSON object. This scans
/// for the first balanced `{...}` (string- and escape-aware, so braces
/// inside string literals don't confuse the depth count) and parses it.
/// Failure behavior is defined: no opening brace, an unbalanced object, or
/// a candidate that doesn't parse as a JSON object all yield `None` and
/// never an error.
pub fn extract_analysis(text: &str) -> Option<Value> {
    let candidate = first_balanced_object(text)?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}

fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    // Still streaming: the object isn't closed yet.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_embedded_in_prose() {
        let text = r#"Here is my analysis: {"crop":"wheat","disease":"rust"} hope it helps"#;
        let v = extract_analysis(text).unwrap();
        assert_eq!(v["crop"], "wheat");
        assert_eq!(v["disease"], "rust");
    }

    #[test]
    fn unbalanced_object_yields_none() {
        assert!(extract_analysis(r#"partial {"crop":"wheat""#).is_none());
    }

    #[test]
    fn no_braces_yields_none() {
        assert!(extract_analysis("the leaves look healthy").is_none());
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_object() {
        let text = r#"{"note":"use } sparingly","ok":true}"#;
        let v = extract_analysis(text).unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn escaped_quotes_inside_strings_are_handled() {
        let text = r#"{"note":"she said \"hi\"","ok":1}"#;
        let v = extract_analysis(text).unwrap();
        assert_eq!(v["ok"], 1);
    }

    #[test]
    fn nested_objects_balance() {
        let text = r#"prefix {"a":{"b":{"c":3}}} suffix"#;
        let v = extract_analysis(text).unwrap();
        assert_eq!(v["a"]["b"]["c"], 3);
    }

    #[test]
    fn unparsable_candidate_yields_none() {
        assert!(extract_analysis("{not json}").is_none());
    }

    #[test]
    fn non_object_json_is_rejected() {
        // A bare array with braces inside shouldn't count; the first brace
        // begins the object candidate, so arrays never match here anyway.
        assert!(extract_analysis("[1, 2, 3]").is_none());
    }
}
