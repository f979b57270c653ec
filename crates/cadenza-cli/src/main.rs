mod args;
mod client;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use reqwest::StatusCode;
use serde_json::Value;

use cadenza_common::{
    GenerationRequest, InferenceOptions, JobAccepted, JobRecord, LyricsResult, ModelStatus,
    PredictResponse,
};

use crate::args::{Args, Command, GenerateArgs, ModelsCommand};
use crate::client::{auth, error_message, save_body, url};
use crate::output::{print_accepted, print_health, print_job, print_lyrics, print_model_status};

fn build_request(g: &GenerateArgs) -> anyhow::Result<GenerationRequest> {
    let lyrics = match &g.lyrics_file {
        Some(path) => Some(
            std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?,
        ),
        None => g.lyrics.clone(),
    };
    let req = GenerationRequest {
        user_id: g.user_id.clone(),
        song_name: g.song_name.clone(),
        lyrics,
        genre: g.genre.clone(),
        prompt: g.prompt.clone(),
        lyrics_only: g.lyrics_only,
        options: InferenceOptions {
            max_new_tokens: g.max_new_tokens,
            run_n_segments: g.run_n_segments,
            ..Default::default()
        },
    };
    req.validate().map_err(anyhow::Error::msg)?;
    Ok(req)
}

fn predict_body(req: &GenerationRequest) -> anyhow::Result<Value> {
    Ok(serde_json::json!({ "instances": [serde_json::to_value(req)?] }))
}

async fn fetch_job(
    client: &reqwest::Client,
    args: &Args,
    request_id: &str,
) -> anyhow::Result<Option<JobRecord>> {
    let resp = auth(
        client.get(url(&args.server_url, &format!("/status/{request_id}"))),
        args.token.as_ref(),
    )
    .send()
    .await?;
    match resp.status() {
        StatusCode::NOT_FOUND => Ok(None),
        s if s.is_success() => Ok(Some(resp.json().await?)),
        _ => bail!("status lookup failed: {}", error_message(&resp.text().await?)),
    }
}

async fn download(
    client: &reqwest::Client,
    args: &Args,
    request_id: &str,
    kind: &str,
    dest: PathBuf,
) -> anyhow::Result<()> {
    let resp = auth(
        client
            .get(url(&args.server_url, &format!("/download/{request_id}")))
            .query(&[("type", kind)]),
        args.token.as_ref(),
    )
    .send()
    .await?;
    if !resp.status().is_success() {
        bail!("{}", error_message(&resp.text().await?));
    }
    let bytes = save_body(resp, &dest).await?;
    println!("✓ Saved {} ({} bytes)", dest.display(), bytes);
    Ok(())
}

async fn generate(client: &reqwest::Client, args: &Args, g: &GenerateArgs) -> anyhow::Result<()> {
    let req = build_request(g)?;
    let resp = auth(
        client.post(url(&args.server_url, "/predict")),
        args.token.as_ref(),
    )
    .json(&predict_body(&req)?)
    .send()
    .await?;

    let status = resp.status();
    if status == StatusCode::ACCEPTED {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("300")
            .to_string();
        println!("… Models are downloading, retry in about {retry_after}s");
        return Ok(());
    }
    if !status.is_success() {
        eprintln!("✗ Failed to submit ({status}): {}", error_message(&resp.text().await?));
        return Ok(());
    }

    if req.lyrics_only {
        let body: PredictResponse<LyricsResult> = resp.json().await?;
        for result in &body.predictions {
            print_lyrics(result);
        }
        return Ok(());
    }

    let body: PredictResponse<JobAccepted> = resp.json().await?;
    let accepted = body
        .predictions
        .into_iter()
        .next()
        .context("server returned no predictions")?;
    print_accepted(&accepted);
    if !g.wait {
        return Ok(());
    }

    let mut last_status = None;
    let job = loop {
        tokio::time::sleep(Duration::from_secs(g.poll_secs.max(1))).await;
        let Some(job) = fetch_job(client, args, &accepted.request_id).await? else {
            bail!("job {} disappeared from the server", accepted.request_id);
        };
        if last_status != Some(job.status) {
            println!("  … {}", job.status);
            last_status = Some(job.status);
        }
        if job.status.is_terminal() {
            break job;
        }
    };
    print_job(&job);

    if let Some(out) = &g.output {
        if job.error.is_none() {
            download(client, args, &job.request_id, "wav", PathBuf::from(out)).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let token = args.token.clone();

    match &args.command {
        Command::Health => {
            let resp = client.get(url(&args.server_url, "/health")).send().await?;
            if resp.status().is_success() {
                let health: Value = resp.json().await?;
                print_health(&health);
            } else {
                eprintln!("✗ Server unhealthy: {}", resp.text().await?);
            }
        }
        Command::Models { subcommand } => match subcommand {
            ModelsCommand::Status => {
                let resp = client
                    .get(url(&args.server_url, "/models/status"))
                    .send()
                    .await?;
                if resp.status().is_success() {
                    let status: ModelStatus = resp.json().await?;
                    print_model_status(&status);
                } else {
                    eprintln!("✗ Failed to fetch model status: {}", resp.text().await?);
                }
            }
            ModelsCommand::Download => {
                println!("… Requesting model download, this can take several minutes");
                let resp = auth(
                    client.post(url(&args.server_url, "/download-models")),
                    token.as_ref(),
                )
                .send()
                .await?;
                let status = resp.status();
                let text = resp.text().await?;
                if status.is_success() {
                    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                    let message = body
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("done");
                    println!("✓ {message}");
                } else {
                    eprintln!("✗ Failed to download models: {}", error_message(&text));
                }
            }
        },
        Command::Generate(g) => generate(&client, &args, g).await?,
        Command::Status { request_id } => match fetch_job(&client, &args, request_id).await? {
            Some(job) => print_job(&job),
            None => eprintln!("✗ Unknown request id: {request_id}"),
        },
        Command::Download {
            request_id,
            kind,
            output,
        } => {
            let dest = output
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("{request_id}.{kind}")));
            if let Err(e) = download(&client, &args, request_id, kind, dest).await {
                eprintln!("✗ Failed to download result: {e}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_args(argv: &[&str]) -> GenerateArgs {
        let mut full = vec!["cadenza", "generate"];
        full.extend_from_slice(argv);
        match Args::try_parse_from(full).unwrap().command {
            Command::Generate(g) => g,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_build_request_with_options() {
        let g = generate_args(&[
            "--lyrics",
            "[verse]\nhello",
            "--genre",
            "jazz",
            "--max-new-tokens",
            "2000",
        ]);
        let req = build_request(&g).unwrap();
        assert_eq!(req.genre.as_deref(), Some("jazz"));
        assert_eq!(req.options.max_new_tokens, Some(2000));

        let body = predict_body(&req).unwrap();
        let inst = &body["instances"][0];
        assert_eq!(inst["lyrics"], "[verse]\nhello");
        assert_eq!(inst["max_new_tokens"], 2000);
        assert!(inst.get("run_n_segments").is_none());
    }

    #[test]
    fn test_build_request_reads_lyrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.txt");
        std::fs::write(&path, "line one\nline two").unwrap();
        let g = generate_args(&["--lyrics-file", path.to_str().unwrap(), "--genre", "rock"]);
        let req = build_request(&g).unwrap();
        assert_eq!(req.lyrics.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn test_build_request_rejects_missing_inputs() {
        let err = build_request(&generate_args(&["--song-name", "x"])).unwrap_err();
        assert!(err.to_string().contains("missing required fields"));
        assert!(build_request(&generate_args(&["--lyrics-only"])).is_err());
        assert!(build_request(&generate_args(&["--lyrics-only", "--prompt", "rain"])).is_ok());
    }
}
