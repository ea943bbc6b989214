// ABOUTME: Text helpers shared across the agent: chunking and log-safe previews
// ABOUTME: Chunking respects the platform's message size limit at line boundaries

/// Maximum characters per outbound platform message
pub const MAX_CHUNK_SIZE: usize = 2000;

/// Char-safe preview of arbitrary text for structured log fields
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Split text into chunks of at most `max_chars` characters, preferring line
/// breaks and falling back to word breaks for oversized lines.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut String, current_len: &mut usize, chunks: &mut Vec<String>| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current).trim().to_string());
            *current_len = 0;
        }
    };

    for line in text.lines() {
        let line_len = line.chars().count();

        if current_len > 0 && current_len + line_len + 1 > max_chars {
            flush(&mut current, &mut current_len, &mut chunks);
        }

        if line_len > max_chars {
            flush(&mut current, &mut current_len, &mut chunks);
            for word in line.split_whitespace() {
                let word_len = word.chars().count();
                if current_len > 0 && current_len + word_len + 1 > max_chars {
                    flush(&mut current, &mut current_len, &mut chunks);
                }
                if current_len > 0 {
                    current.push(' ');
                    current_len += 1;
                }
                current.push_str(word);
                current_len += word_len;
            }
        } else {
            if current_len > 0 {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(line);
            current_len += line_len;
        }
    }
    flush(&mut current, &mut current_len, &mut chunks);

    chunks.retain(|c| !c.is_empty());
    chunks
}
