//! The terminal page.
//!
//! A single HTML document with a small inline script. The script holds no
//! game state of its own: it loads `/api/state`, then applies the events
//! from `/api/events` and posts commands back.

use crate::shell::BOOT_SEQUENCE;

/// Wrap `content` in the page skeleton.
#[must_use]
pub fn html_shell(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="zh-CN">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body class="theme-green">
{content}
<script>{SCRIPT}</script>
</body>
</html>"#
    )
}

/// The full terminal page.
#[must_use]
pub fn terminal_page() -> String {
    html_shell("幻境终端", &terminal_content())
}

fn terminal_content() -> String {
    format!(
        r#"
<div id="boot-screen" class="boot" data-lines="{lines}">
    <div class="boot-title">幻境终端</div>
    <div id="boot-log" class="boot-log"></div>
    <div class="boot-hint">[ 点击屏幕 插入硬币 ]</div>
</div>
<div id="console" class="console hidden">
    <header>
        <h1><span class="red">幻境</span>终端</h1>
        <button id="mute" type="button">静音</button>
        <span id="busy" class="led"></span>
    </header>
    <main>
        <section class="viewport">
            <img id="scene" class="hidden" alt="Scene">
            <div id="no-signal" class="no-signal">无视频信号输入<br>视觉模块加载中...</div>
        </section>
        <section class="terminal">
            <div id="log" class="log"></div>
            <form id="prompt">
                <span>&gt;</span>
                <input id="input" name="input" autocomplete="off" autofocus>
            </form>
        </section>
    </main>
    <footer>指令: /theme [green|amber|cyan] | /cls (清屏) | /mute</footer>
</div>
"#,
        lines = BOOT_SEQUENCE.len()
    )
}

const STYLE: &str = r"
body { margin: 0; background: #1a1a1a; color: #eee; font-family: monospace; }
.hidden { display: none !important; }
.boot { height: 100vh; display: flex; flex-direction: column; align-items: center; justify-content: center; background: #000; cursor: pointer; }
.boot-title { font-size: 3rem; color: #facc15; letter-spacing: .3em; margin-bottom: 2rem; }
.boot-log { width: min(40rem, 90vw); min-height: 9rem; padding: 1.5rem; border: 4px solid #fff; background: #1e3a8a; color: #4ade80; }
.boot-hint { margin-top: 2rem; color: #9ca3af; }
.console { max-width: 64rem; margin: 2vh auto; height: 90vh; display: flex; flex-direction: column; background: #2a2a2a; padding: 1rem; border-radius: .75rem; }
.console header { display: flex; align-items: center; gap: 1rem; }
.console header h1 { flex: 1; font-size: 1.4rem; margin: 0 0 1rem; }
.red { color: #ef4444; }
.led { width: .75rem; height: .75rem; border-radius: 50%; background: #7f1d1d; }
.led.on { background: #ef4444; }
main { flex: 1; display: flex; gap: 1rem; min-height: 0; }
.viewport { width: 33%; border: 4px solid #fff; background: #000; display: flex; align-items: center; justify-content: center; }
.viewport img { width: 100%; height: 100%; object-fit: cover; image-rendering: pixelated; }
.no-signal { color: #4b5563; text-align: center; font-size: .8rem; }
.terminal { flex: 1; display: flex; flex-direction: column; border: 4px solid #fff; background: #000; }
.log { flex: 1; overflow-y: auto; padding: 1rem; font-size: 1.15rem; line-height: 1.6; white-space: pre-wrap; }
.msg { margin-bottom: 1rem; }
.msg.USER::before { content: '玩家'; display: block; width: fit-content; font-size: .7rem; color: #fff; border: 1px solid #4b5563; padding: 0 .4rem; margin-bottom: .25rem; }
.msg.SYSTEM { color: #ef4444; font-weight: bold; font-size: .9rem; }
.msg.typing::after { content: '█'; }
#prompt { display: flex; gap: .5rem; padding: 1rem; border-top: 2px solid #fff; }
#prompt input { flex: 1; background: transparent; border: none; color: inherit; font: inherit; outline: none; }
footer { text-align: center; color: #6b7280; font-size: .7rem; margin-top: .5rem; }
.theme-green .log, .theme-green #prompt { color: #4ade80; }
.theme-amber .log, .theme-amber #prompt { color: #fbbf24; }
.theme-cyan .log, .theme-cyan #prompt { color: #22d3ee; }
";

const SCRIPT: &str = r"
const $ = (id) => document.getElementById(id);
const post = (path, body) => fetch(path, {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: body === undefined ? undefined : JSON.stringify(body),
}).then((r) => r.json().catch(() => null));

let messages = [];

function renderMessages() {
    const log = $('log');
    const boot = $('boot-log');
    log.replaceChildren();
    boot.replaceChildren();
    for (const m of messages) {
        const div = document.createElement('div');
        div.className = `msg ${m.sender}` + (m.typing ? ' typing' : '');
        div.textContent = m.text;
        log.appendChild(div);
        if (m.sender === 'SYSTEM') {
            const line = document.createElement('div');
            line.textContent = m.text;
            boot.appendChild(line);
        }
    }
    log.scrollTop = log.scrollHeight;
}

function setPhase(phase) {
    $('boot-screen').classList.toggle('hidden', phase !== 'boot');
    $('console').classList.toggle('hidden', phase === 'boot');
    if (phase === 'playing') $('input').focus();
}

function setTheme(theme) { document.body.className = `theme-${theme}`; }
function setProcessing(on) { $('busy').classList.toggle('on', on); $('input').disabled = on; if (!on) $('input').focus(); }
function setMuted(muted) { $('mute').textContent = muted ? '开启音效' : '静音'; }
function setScene(uri) {
    $('scene').src = uri || '';
    $('scene').classList.toggle('hidden', !uri);
    $('no-signal').classList.toggle('hidden', !!uri);
}

function applySnapshot(s) {
    messages = s.messages;
    renderMessages();
    setPhase(s.phase);
    setTheme(s.theme);
    setProcessing(s.processing);
    setMuted(s.muted);
    setScene(s.scene && s.scene.data_uri);
}

const handlers = {
    'message.appended': (m) => { messages.push(m); renderMessages(); },
    'message.updated': (u) => {
        const m = messages.find((x) => x.id === u.id);
        if (m) { m.text = u.text; m.typing = u.typing; renderMessages(); }
    },
    'transcript.cleared': () => { messages = []; renderMessages(); },
    'phase.changed': (d) => setPhase(d.phase),
    'theme.changed': (d) => setTheme(d.theme),
    'processing.changed': (d) => setProcessing(d.processing),
    'scene.updated': (d) => setScene(d.data_uri),
    'effect': (d) => window.dispatchEvent(new CustomEvent('phantom-effect', { detail: d.effect })),
};

async function connect() {
    const res = await fetch('/api/state');
    applySnapshot(await res.json());
    const events = new EventSource('/api/events');
    for (const [name, apply] of Object.entries(handlers)) {
        events.addEventListener(name, (e) => apply(JSON.parse(e.data).data));
    }
    events.onerror = () => fetch('/api/state').then((r) => r.json()).then(applySnapshot);
    post('/api/boot');
}

$('boot-screen').addEventListener('click', () => post('/api/start'));
$('mute').addEventListener('click', () => post('/api/effects/mute').then((r) => r && setMuted(r.muted)));
$('input').addEventListener('keydown', (e) => { if (e.key.length === 1) post('/api/effects/keystroke'); });
$('prompt').addEventListener('submit', (e) => {
    e.preventDefault();
    const input = $('input').value;
    $('input').value = '';
    post('/api/command', { input }).then((r) => {
        if (r && r.status === 'mute_toggled') setMuted(r.muted);
    });
});

connect();
";
