use std::collections::BTreeSet;

pub fn next_free_name<S: AsRef<str>>(base: &str, existing: &[S]) -> String {
    let taken: BTreeSet<&str> = existing.iter().map(|s| s.as_ref()).collect();
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut n: usize = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken.contains(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

pub fn row_file_name(row_index: usize) -> String {
    format!("row_{:04}.yaml", row_index)
}

pub fn id_token(raw: &str) -> String {
    raw.trim().replace('.', "p")
}

pub fn is_safe_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && !run_id.contains('/')
        && !run_id.contains('\\')
}
