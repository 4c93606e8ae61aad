// Config Renderer
// Turns the egress template and destination list into nginx configuration text

use crate::models::Destination;
use crate::services::errors::ConfigError;

/// Marker replaced with the ingest application key
pub const INGEST_KEY_MARKER: &str = "{{INGEST_KEY}}";

/// Marker replaced with the generated push directive block
pub const PUSH_DESTINATIONS_MARKER: &str = "{{PUSH_DESTINATIONS}}";

/// Emitted in place of the push block when no destination is enabled, so an
/// intentionally empty block stays distinguishable from a failed render
const NO_DESTINATIONS_PLACEHOLDER: &str = "            # No destinations configured";

/// Render the configuration text for the given template and destinations.
///
/// Pure function: identical inputs always produce byte-identical output.
/// Disabled destinations are skipped; enabled ones are emitted in input
/// order. Fails before producing anything when the ingest key is empty.
pub fn render(
    template: &str,
    destinations: &[Destination],
    ingest_key: &str,
) -> Result<String, ConfigError> {
    if ingest_key.is_empty() {
        return Err(ConfigError::MissingIngestKey);
    }

    let push_lines: Vec<String> = destinations
        .iter()
        .filter(|dest| dest.enabled)
        .map(push_directive)
        .collect();

    let push_block = if push_lines.is_empty() {
        NO_DESTINATIONS_PLACEHOLDER.to_string()
    } else {
        push_lines.join("\n")
    };

    // Literal find/replace, first occurrence only; an absent marker is a no-op
    let config = template.replacen(PUSH_DESTINATIONS_MARKER, &push_block, 1);
    let config = config.replacen(INGEST_KEY_MARKER, ingest_key, 1);

    Ok(config)
}

/// Relay directive for a single destination.
///
/// nginx-rtmp's native push module cannot terminate TLS, so rtmps targets go
/// through an ffmpeg copy pipe pulling from the local ingest application.
fn push_directive(dest: &Destination) -> String {
    let target = dest.push_url();
    if dest.is_secure() {
        format!(
            "            exec_push ffmpeg -i rtmp://127.0.0.1:1935/$app/$name -c copy -f flv \"{target}\";"
        )
    } else {
        format!("            push \"{target}\";")
    }
}
