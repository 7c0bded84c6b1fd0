//! Generation of the container-side client script.
//!
//! The script is the entire container half of the proxy: it publishes a
//! request atomically, keeps the heartbeat fresh, streams the response
//! files to its own stdout/stderr, and translates the exit line into its
//! own exit status. It is plain POSIX sh so it runs in any container image
//! that has a shell, and it is parameterized by the bound command name
//! only.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// `@CMD@` is replaced with the single-quoted bound command name.
const TEMPLATE: &str = r#"#!/bin/sh
# Generated by gangway. Forwards this invocation to the host-side watcher
# over the shared proxy directory, mirroring streams and exit status.
set -u

cmd=@CMD@
dir=${PROXY_DIR:-$(CDPATH= cd -- "$(dirname -- "$0")" && pwd)}
timeout=${PROXY_TIMEOUT:-300}
case "$timeout" in ''|*[!0-9]*) timeout=300;; esac

gen_uuid() {
    if [ -r /proc/sys/kernel/random/uuid ]; then
        cat /proc/sys/kernel/random/uuid
    else
        printf '%s-%s-%s\n' "$(date +%s)" "$$" \
            "$(awk 'BEGIN{srand(); printf "%08x", int(rand()*4294967296)}')"
    fi
}

u=$(gen_uuid)

hb_pid=
out_pid=
err_pid=
cleanup() {
    [ -n "$hb_pid" ] && kill "$hb_pid" 2>/dev/null
    [ -n "$out_pid" ] && kill "$out_pid" 2>/dev/null
    [ -n "$err_pid" ] && kill "$err_pid" 2>/dev/null
    rm -f "$dir/$u.req" "$dir/$u.req.tmp" "$dir/$u.stdin" \
        "$dir/$u.stdout" "$dir/$u.stderr" "$dir/$u.exit"
}
trap cleanup EXIT
trap 'exit 130' INT
trap 'exit 143' TERM

touch "$dir/.heartbeat" 2>/dev/null

# stdin is captured before the request is published: the host only looks
# for $u.stdin after $u.req has appeared.
if [ ! -t 0 ]; then
    cat > "$dir/$u.stdin" || { echo "$cmd: proxy: cannot capture stdin" >&2; exit 127; }
fi

{
    printf '%s\0' "$cmd"
    for a in "$@"; do
        printf '%s\0' "$a"
    done
} > "$dir/$u.req.tmp" 2>/dev/null \
    || { echo "$cmd: proxy: cannot write request" >&2; exit 127; }
# Commit point: the watcher never sees a partially written request.
mv "$dir/$u.req.tmp" "$dir/$u.req" 2>/dev/null \
    || { echo "$cmd: proxy: cannot publish request" >&2; exit 127; }

( while [ ! -f "$dir/$u.exit" ]; do
      touch "$dir/.heartbeat" 2>/dev/null
      sleep 0.3
  done ) &
hb_pid=$!

# Stream a response file by byte offset until the exit marker appears, then
# drain the remainder. The host writes the exit marker strictly after the
# last output byte, so the final drain is complete.
pump() {
    f=$1
    off=0
    while :; do
        if [ -f "$f" ]; then
            sz=$(wc -c < "$f" 2>/dev/null); sz=$((${sz:-0} + 0))
            if [ "$sz" -gt "$off" ]; then
                tail -c +$((off + 1)) "$f" | head -c $((sz - off))
                off=$sz
            fi
        fi
        if [ -f "$dir/$u.exit" ]; then
            sz=$(wc -c < "$f" 2>/dev/null); sz=$((${sz:-0} + 0))
            if [ "$sz" -gt "$off" ]; then
                tail -c +$((off + 1)) "$f"
            fi
            return 0
        fi
        sleep 0.05
    done
}

pump "$dir/$u.stdout" &
out_pid=$!
pump "$dir/$u.stderr" >&2 &
err_pid=$!

if command -v inotifywait >/dev/null 2>&1; then
    have_inotify=1
else
    have_inotify=0
fi

deadline=$(( $(date +%s) + timeout ))
while [ ! -f "$dir/$u.exit" ]; do
    if [ "$(date +%s)" -ge "$deadline" ]; then
        echo "$cmd: proxy timeout after ${timeout}s" >&2
        exit 124
    fi
    if [ "$have_inotify" = 1 ]; then
        inotifywait -qq -t 1 -e close_write,moved_to "$dir" 2>/dev/null || :
    else
        sleep 0.05
    fi
done

wait "$out_pid" 2>/dev/null || :
wait "$err_pid" 2>/dev/null || :
out_pid=
err_pid=

status=$(cat "$dir/$u.exit" 2>/dev/null) \
    || { echo "$cmd: proxy: cannot read exit status" >&2; exit 126; }
code=${status%%:*}
case "$code" in
    ''|*[!0-9]*) echo "$cmd: proxy: malformed exit status '$status'" >&2; exit 126;;
esac
[ "$code" -gt 255 ] && code=$((code % 256))
exit "$code"
"#;

/// Render the client script for one bound command.
pub fn render(cmd: &str) -> String {
    TEMPLATE.replace("@CMD@", &single_quote(cmd))
}

/// Write the script as `<dir>/<cmd>`, mode 0755.
pub fn install(dir: &Path, cmd: &str) -> io::Result<PathBuf> {
    let path = dir.join(cmd);
    std::fs::write(&path, render(cmd))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Single-quote a string for sh. A literal `'` becomes `'\''`.
fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
