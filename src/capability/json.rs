use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Capability, CapabilityError, CapabilityRequest, UsageLedger};

const JSON_ONLY_SUFFIX: &str =
    "\n\nReturn ONLY a valid JSON object that satisfies the schema. Do not add commentary.";

/// A structured capability answer. `check_schema` sees the raw JSON before deserialising;
/// `validate` covers the numeric bounds serde cannot express.
pub trait JsonResponse: DeserializeOwned {
    fn check_schema(_raw: &Value) -> Result<(), String> {
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Runs a compiled JSON schema over `raw`, joining every violation into one message.
pub fn schema_violations(validator: &Validator, raw: &Value) -> Result<(), String> {
    let messages = validator
        .iter_errors(raw)
        .map(|err| err.to_string())
        .collect::<Vec<String>>();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join(" | "))
    }
}

/// Returns the first balanced `{...}` span, ignoring braces inside JSON strings.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, character) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == '"' {
                in_string = false;
            }
            continue;
        }
        match character {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + character.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn parse_json_content<T: JsonResponse>(content: &str) -> Result<T, CapabilityError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CapabilityError::EmptyResponse);
    }

    let raw = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => value,
        direct => {
            let span = extract_first_json_object(trimmed).ok_or_else(|| {
                let reason = match direct {
                    Err(err) => err.to_string(),
                    Ok(_) => "top-level value is not an object".to_string(),
                };
                CapabilityError::Schema(format!("no JSON object found: {reason}"))
            })?;
            serde_json::from_str::<Value>(span)
                .map_err(|err| CapabilityError::Schema(err.to_string()))?
        }
    };
    T::check_schema(&raw).map_err(CapabilityError::Schema)?;
    let parsed =
        serde_json::from_value::<T>(raw).map_err(|err| CapabilityError::Schema(err.to_string()))?;
    parsed.validate().map_err(CapabilityError::Schema)?;
    Ok(parsed)
}

/// Invokes the capability and parses a `T` out of the answer. An unparseable answer is retried
/// once with an explicit JSON-only instruction appended to the user prompt.
pub async fn invoke_json<T, C>(
    capability: &C,
    request: &CapabilityRequest,
    ledger: &mut UsageLedger,
) -> Result<T, CapabilityError>
where
    T: JsonResponse,
    C: Capability + ?Sized,
{
    let response = capability.invoke(request).await?;
    ledger.record(request.stage, response.usage.as_ref());

    let first_err = match parse_json_content::<T>(&response.content) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    warn!(
        stage = request.stage.as_str(),
        error = %first_err,
        "unparseable capability output; retrying with json-only prompt"
    );

    let mut strict = request.clone();
    strict.user_prompt.push_str(JSON_ONLY_SUFFIX);
    let response = capability.invoke(&strict).await?;
    ledger.record(request.stage, response.usage.as_ref());

    parse_json_content::<T>(&response.content).map_err(|err| {
        debug!(stage = request.stage.as_str(), error = %err, "json-only retry failed");
        err
    })
}
