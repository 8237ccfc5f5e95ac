use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_audiolink"))
}

fn tmp_path(name: &str) -> PathBuf {
    let dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("audiolink-cli");
    fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir.join(name)
}

fn create_test_file(name: &str, content: &[u8]) -> PathBuf {
    let path = tmp_path(name);
    fs::write(&path, content).expect("Failed to write test file");
    path
}

fn run_audiolink(args: &[&str]) -> Output {
    Command::new(binary())
        .args(args)
        .env_remove("AUDIOLINK_BITRATE")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute audiolink")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_bitrates_lists_every_configuration() {
    let output = run_audiolink(&["bitrates"]);
    assert!(output.status.success());

    let text = String::from_utf8_lossy(&output.stdout);
    let keys: Vec<&str> = text
        .lines()
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .collect();
    assert_eq!(keys, ["1", "2", "4", "8", "12", "16", "20"]);
}

#[test]
fn test_send_recv_raw_pcm_files() {
    let input = create_test_file("raw_input.bin", b"Test message over raw PCM");
    let audio = tmp_path("raw_audio.pcm");
    let output = tmp_path("raw_output.bin");

    let sent = run_audiolink(&[
        "-b",
        "8",
        "send",
        "-i",
        input.to_str().unwrap(),
        "-o",
        audio.to_str().unwrap(),
    ]);
    assert!(sent.status.success(), "send failed: {}", stderr(&sent));

    let size = fs::metadata(&audio).expect("Audio file not created").len();
    assert_eq!(size % 2, 0, "PCM must hold whole 16-bit samples");
    assert!(size > 64_000, "Audio too short: {} bytes", size);

    let received = run_audiolink(&[
        "-b",
        "8",
        "recv",
        "-i",
        audio.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ]);
    assert!(received.status.success(), "recv failed: {}", stderr(&received));
    assert_eq!(fs::read(&output).unwrap(), b"Test message over raw PCM");
}

#[test]
fn test_send_recv_wav_files() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(600).collect();
    let input = create_test_file("wav_input.bin", &payload);
    let audio = tmp_path("wav_audio.wav");
    let output = tmp_path("wav_output.bin");

    let sent = run_audiolink(&[
        "-b",
        "16",
        "send",
        "-i",
        input.to_str().unwrap(),
        "-o",
        audio.to_str().unwrap(),
        "-g",
        "0.5",
    ]);
    assert!(sent.status.success(), "send failed: {}", stderr(&sent));

    let reader = hound::WavReader::open(&audio).expect("Not a WAV file");
    assert_eq!(reader.spec().sample_rate, 32000);
    assert_eq!(reader.spec().channels, 1);
    drop(reader);

    let received = run_audiolink(&[
        "-b",
        "16",
        "recv",
        "-i",
        audio.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ]);
    assert!(received.status.success(), "recv failed: {}", stderr(&received));
    assert_eq!(fs::read(&output).unwrap(), payload);
}

#[test]
fn test_pipe_through_stdin_and_stdout() {
    let mut sender = Command::new(binary())
        .args(["-q", "send"])
        .env("AUDIOLINK_BITRATE", "4")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("Failed to spawn sender");
    sender
        .stdin
        .take()
        .unwrap()
        .write_all(b"piped payload")
        .unwrap();
    let sent = sender.wait_with_output().unwrap();
    assert!(sent.status.success());

    let mut receiver = Command::new(binary())
        .args(["-q", "recv"])
        .env("AUDIOLINK_BITRATE", "4")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("Failed to spawn receiver");
    // the receiver may exit before reading the trailing silence
    let _ = receiver.stdin.take().unwrap().write_all(&sent.stdout);
    let received = receiver.wait_with_output().unwrap();
    assert!(received.status.success(), "recv failed: {}", stderr(&received));
    assert_eq!(received.stdout, b"piped payload");
}

#[test]
fn test_recv_dump_and_failure() {
    let input = create_test_file("dump_input.bin", b"dump");
    let audio = tmp_path("dump_audio.pcm");
    let dump = tmp_path("dump_copy.pcm");
    let output = tmp_path("dump_output.bin");

    let sent = run_audiolink(&[
        "send",
        "-i",
        input.to_str().unwrap(),
        "-o",
        audio.to_str().unwrap(),
    ]);
    assert!(sent.status.success());

    let received = run_audiolink(&[
        "recv",
        "-i",
        audio.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "-d",
        dump.to_str().unwrap(),
    ]);
    assert!(received.status.success(), "recv failed: {}", stderr(&received));
    let original = fs::read(&audio).unwrap();
    let dumped = fs::read(&dump).unwrap();
    assert!(!dumped.is_empty());
    assert!(original.starts_with(&dumped));

    // silence never yields a carrier
    let silence = create_test_file("silence.pcm", &vec![0u8; 2 * 32000 * 2]);
    let failed = run_audiolink(&["recv", "-i", silence.to_str().unwrap(), "-o", output.to_str().unwrap()]);
    assert!(!failed.status.success(), "Decoding silence must fail");
}

#[test]
fn test_unknown_bitrate_rejected() {
    let output = run_audiolink(&["-b", "3", "send", "-i", "/dev/null"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unsupported bitrate"));
}
