//! Presentation cleanup applied to responses before synthesis

/// Strip markdown markup that would be read aloud and collapse whitespace
pub fn clean_for_speech(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let line = line.trim_start();
        let line = line.trim_start_matches('#');
        let line = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .unwrap_or(line);

        for word in line.split_whitespace() {
            let word: String = word.chars().filter(|c| !matches!(c, '*' | '`' | '~')).collect();
            if word.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&word);
        }
    }

    out
}
