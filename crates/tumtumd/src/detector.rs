use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tumtum_core::{DetectedFace, DetectionError, FaceDetector, Frame, Point, Rect};

/// Runs an external detector program once per frame.
///
/// The frame goes to the child's stdin as PNG. The child answers on stdout
/// with `{"faces": [{"box": [x, y, w, h], "nose_tip": [[x, y], ...],
/// "nose_bridge": [[x, y], ...]}]}`.
///
/// A child that has not exited within the timeout is killed and the frame
/// counts as a failed detection.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

pub const DEFAULT_DETECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between exit checks while waiting on the child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl CommandDetector {
    pub fn new(argv: &[String]) -> Result<Self, DetectionError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DetectionError::Failed("empty detector command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: DEFAULT_DETECTOR_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read a pipe to the end on its own thread.
///
/// The receiver gets nothing if the pipe is still held open by a grandchild
/// when the caller gives up, so readers are never joined.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "detector already exited");
    }
    let _ = child.wait();
}

impl FaceDetector for CommandDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError> {
        let png = frame
            .to_png()
            .map_err(|e| DetectionError::Failed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // Writing happens off-thread too: a child that never reads would
        // otherwise block us on a full pipe. A child closing stdin early is
        // not an error here; its exit status decides.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                let _ = stdin.write_all(&png);
            });
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    kill_and_reap(&mut child);
                    tracing::warn!(
                        program = %self.program,
                        timeout = ?self.timeout,
                        "detector killed"
                    );
                    return Err(DetectionError::TimedOut(self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill_and_reap(&mut child);
                    return Err(e.into());
                }
            }
        };

        // The child has exited; its pipes close unless a grandchild kept them.
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(POLL_INTERVAL);
        let stdout = stdout
            .recv_timeout(remaining)
            .map_err(|_| DetectionError::TimedOut(self.timeout))?;

        if !status.success() {
            let stderr = stderr.recv_timeout(remaining).unwrap_or_default();
            return Err(DetectionError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        parse_faces(&stdout)
    }
}

/// Never finds a face. Used when no detector program is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDetector;

impl FaceDetector for NullDetector {
    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError> {
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
struct DetectorOutput {
    #[serde(default)]
    faces: Vec<WireFace>,
}

#[derive(Deserialize)]
struct WireFace {
    #[serde(rename = "box")]
    bounds: [i32; 4],
    #[serde(default)]
    nose_tip: Vec<[i32; 2]>,
    #[serde(default)]
    nose_bridge: Vec<[i32; 2]>,
}

fn points(raw: Vec<[i32; 2]>) -> Vec<Point> {
    raw.into_iter().map(|[x, y]| Point::new(x, y)).collect()
}

fn parse_faces(stdout: &[u8]) -> Result<Vec<DetectedFace>, DetectionError> {
    let output: DetectorOutput =
        serde_json::from_slice(stdout).map_err(|e| DetectionError::BadOutput(e.to_string()))?;
    Ok(output
        .faces
        .into_iter()
        .map(|f| {
            let [x, y, w, h] = f.bounds;
            DetectedFace {
                bounds: Rect::new(x, y, w, h),
                nose_tip: points(f.nose_tip),
                nose_bridge: points(f.nose_bridge),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame() -> Frame {
        Frame::from_rgb(vec![0; 4 * 4 * 3], 4, 4, Duration::ZERO).unwrap()
    }

    fn sh(script: &str) -> CommandDetector {
        CommandDetector::new(&["sh".to_string(), "-c".to_string(), script.to_string()]).unwrap()
    }

    #[test]
    fn test_parse_faces_with_landmarks() {
        let faces = parse_faces(
            br#"{"faces":[{"box":[120,120,150,150],"nose_tip":[[160,170],[175,172]],"nose_bridge":[[168,140]]}]}"#,
        )
        .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bounds, Rect::new(120, 120, 150, 150));
        assert_eq!(faces[0].nose_tip, vec![Point::new(160, 170), Point::new(175, 172)]);
        assert_eq!(faces[0].nose_bridge.len(), 1);
    }

    #[test]
    fn test_parse_faces_defaults() {
        assert!(parse_faces(b"{}").unwrap().is_empty());
        let faces = parse_faces(br#"{"faces":[{"box":[1,2,3,4]}]}"#).unwrap();
        assert!(faces[0].nose_tip.is_empty());
    }

    #[test]
    fn test_parse_faces_rejects_garbage() {
        assert!(matches!(
            parse_faces(b"no faces here"),
            Err(DetectionError::BadOutput(_))
        ));
        assert!(matches!(
            parse_faces(br#"{"faces":[{"box":[1,2,3]}]}"#),
            Err(DetectionError::BadOutput(_))
        ));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandDetector::new(&[]).is_err());
    }

    #[test]
    fn test_command_round_trip() {
        let detector =
            sh(r#"cat > /dev/null; echo '{"faces":[{"box":[5,6,7,8],"nose_tip":[[9,9]]}]}'"#);
        let faces = detector.detect(&frame()).unwrap();
        assert_eq!(faces[0].bounds, Rect::new(5, 6, 7, 8));
    }

    #[test]
    fn test_command_receives_png() {
        // Reports a face only when stdin starts with the PNG signature.
        let detector = sh(
            r#"sig=$(head -c 4 | tail -c 3); cat > /dev/null; if [ "$sig" = "PNG" ]; then echo '{"faces":[{"box":[1,1,1,1]}]}'; else echo '{}'; fi"#,
        );
        assert_eq!(detector.detect(&frame()).unwrap().len(), 1);
    }

    #[test]
    fn test_command_failure_is_error() {
        let detector = sh("cat > /dev/null; echo oops >&2; exit 3");
        match detector.detect(&frame()) {
            Err(DetectionError::Failed(msg)) => assert!(msg.contains("oops")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_hung_command_is_killed_at_deadline() {
        let detector = sh("cat > /dev/null; sleep 10").with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let result = detector.detect(&frame());
        assert!(matches!(result, Err(DetectionError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_command_ignoring_stdin_still_answers() {
        let big = Frame::from_rgb(vec![7; 640 * 480 * 3], 640, 480, Duration::ZERO).unwrap();
        let detector = sh(r#"echo '{"faces":[]}'"#);
        assert!(detector.detect(&big).unwrap().is_empty());
    }

    #[test]
    fn test_null_detector_finds_nothing() {
        assert!(NullDetector.detect(&frame()).unwrap().is_empty());
    }
}
