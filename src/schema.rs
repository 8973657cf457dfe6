use jsonschema::JSONSchema;
use serde_json::Value;

/// Checks that `schema` is itself a compilable JSON schema.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    JSONSchema::compile(schema)
        .map(|_| ())
        .map_err(|err| format!("invalid JSON schema: {err}"))
}

/// Validates `value` against `schema`, returning every violation message.
pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<(), Vec<String>> {
    let compiled = match JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(err) => return Err(vec![format!("invalid JSON schema: {err}")]),
    };
    let result = compiled.validate(value);
    match result {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors
            .map(|err| err.to_string())
            .collect::<Vec<String>>()),
    }
}
