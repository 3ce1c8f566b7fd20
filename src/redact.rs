/// Masks credentials before a message reaches the logs or a run record.
pub(crate) fn sanitize_log_message(input: &str) -> String {
    let out = input
        .replace("Authorization", "[REDACTED_HEADER]")
        .replace("Bearer ", "[REDACTED_BEARER] ")
        .replace("api_key", "[REDACTED_FIELD]");
    redact_prefixed_secret_like(&out)
}

fn redact_prefixed_secret_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        if i + 3 <= chars.len()
            && chars[i] == 's'
            && chars[i + 1] == 'k'
            && chars[i + 2] == '-'
            && (i == 0 || !chars[i - 1].is_ascii_alphanumeric())
        {
            let mut j = i + 3;
            let mut token_len = 0usize;
            while j < chars.len()
                && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '-')
            {
                token_len += 1;
                j += 1;
            }
            if token_len >= 12 {
                out.push_str("[REDACTED_KEY]");
                i = j;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
