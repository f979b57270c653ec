use cadenza_common::{JobAccepted, JobRecord, LyricsResult, ModelStatus};
use serde_json::Value;

pub fn print_model_status(status: &ModelStatus) {
    println!("\n=== Cadenza Models ===");
    println!("  {:<12} {}", "State:", status.state.as_str().to_uppercase());
    println!("  {:<12} {}", "Message:", status.message);
    if let Some(err) = &status.error {
        println!("  {:<12} {}", "Last error:", err);
    }

    println!("\n[Artifacts]");
    if status.artifacts.is_empty() {
        println!("  (No artifacts configured)");
    } else {
        println!("  {:<10} {:<35} {:<8} {:<6} {}", "Name", "Source", "Ready", "Files", "Path");
        for a in &status.artifacts {
            println!(
                "  {:<10} {:<35} {:<8} {:<6} {}",
                a.name,
                a.source,
                if a.ready { "yes" } else { "no" },
                a.file_count,
                a.path
            );
        }
    }
    println!();
}

pub fn print_health(health: &Value) {
    println!("\n=== Cadenza Server Health ===");
    let field = |path: &str| {
        health
            .pointer(path)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "N/A".to_string())
    };
    println!("  {:<14} {}", "Status:", field("/status"));
    println!("  {:<14} {}", "Models:", field("/models/state"));
    println!("  {:<14} {}", "Message:", field("/message"));
    println!(
        "  {:<14} {}/{}",
        "Queue:",
        field("/queue/depth"),
        field("/queue/capacity")
    );
    println!("  {:<14} {}", "Jobs tracked:", field("/jobs"));
    println!();
}

pub fn print_accepted(accepted: &JobAccepted) {
    println!("✓ Job {} queued", accepted.request_id);
    println!(
        "  position {} (about {}s), song '{}' for {}",
        accepted.queue_position,
        accepted.estimated_wait_time_seconds,
        accepted.song_name,
        accepted.user_id
    );
}

pub fn print_job(job: &JobRecord) {
    println!("\n=== Job {} ===", job.request_id);
    println!("  {:<16} {}", "Status:", job.status);
    println!("  {:<16} {}", "Song:", job.song_name);
    println!("  {:<16} {}", "User:", job.user_id);
    if let Some(genre) = &job.genre {
        println!("  {:<16} {}", "Genre:", genre);
    }
    if let Some(pos) = job.queue_position {
        println!(
            "  {:<16} {} (about {}s)",
            "Queue position:",
            pos,
            job.estimated_wait_time_seconds.unwrap_or_default()
        );
    }
    if let Some(secs) = job.processing_time_secs {
        println!("  {:<16} {:.1}s", "Processing:", secs);
    }
    if let Some(err) = &job.error {
        println!("  {:<16} {}", "Error:", err);
    }
    if !job.file_paths.is_empty() {
        println!("\n[Files]");
        for (kind, path) in &job.file_paths {
            println!("  {:<6} {}", kind, path);
        }
    }
    if let Some(url) = &job.download_url {
        println!("\n  Download: {url}");
    }
    println!();
}

pub fn print_lyrics(result: &LyricsResult) {
    if let Some(genre) = &result.genre {
        println!("Genre: {genre}\n");
    }
    println!("{}", result.lyrics);
}
