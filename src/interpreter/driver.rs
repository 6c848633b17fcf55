// src/interpreter/driver.rs
//! Generation of the worker driver script.
//!
//! Each interpreter worker runs its environment's own interpreter on a small
//! stdlib-only driver. The driver owns the worker end of the channel
//! (length-prefixed frames over stdin/stdout), keeps the persistent
//! namespace, parses and executes submitted code, and applies the capture
//! hooks registered at spawn time. The hook prelude is spliced into the
//! template at generation, so the hook set is fixed for the lifetime of the
//! worker.

use super::hooks;

/// Marker line replaced with the hook prelude.
const HOOK_MARKER: &str = "### CAPTURE HOOKS ###";

/// Render the driver script with the given hook prelude.
pub fn generate_driver(hook_prelude: &str) -> String {
    DRIVER_TEMPLATE.replace(HOOK_MARKER, hook_prelude)
}

/// Render the driver with the process-wide hook registry as of now.
pub fn generate_driver_with_registered_hooks() -> String {
    generate_driver(&hooks::prelude_snapshot())
}

const DRIVER_TEMPLATE: &str = r#"import ast
import io
import json
import os
import struct
import sys
import traceback
from contextlib import ExitStack, contextmanager

_TAG_STRUCTURED = 0
_TAG_BINARY = 1
_FILENAME = "<cillow>"

# Take over the real stdio before user code can touch it: the channel owns
# the original descriptors, stray writes land in a sink instead.
_channel_in = os.fdopen(os.dup(sys.stdin.fileno()), "rb", buffering=0)
_channel_out = os.fdopen(os.dup(sys.stdout.fileno()), "wb", buffering=0)


class _SinkWriter:
    def write(self, text):
        return len(text)

    def flush(self):
        pass


sys.stdin = open(os.devnull, "r")
sys.stdout = _SinkWriter()


def _read_exact(count):
    data = b""
    while len(data) < count:
        chunk = _channel_in.read(count - len(data))
        if not chunk:
            return None
        data += chunk
    return data


def _read_frame():
    header = _read_exact(4)
    if header is None:
        return None
    (length,) = struct.unpack(">I", header)
    if length == 0:
        return b""
    return _read_exact(length)


def _write_frame(body):
    view = memoryview(struct.pack(">I", len(body)) + body)
    while view:
        written = _channel_out.write(view)
        view = view[written:]


def _send_json(obj):
    _write_frame(bytes([_TAG_STRUCTURED]) + json.dumps(obj).encode("utf-8"))


def _emit_stream(kind, text):
    if not isinstance(text, str):
        text = str(text)
    _send_json({"kind": "stream", "stream": kind, "text": text})


def _emit_bytes(kind, data, id=None):
    kind_bytes = kind.encode("utf-8")
    id_bytes = (id or "").encode("utf-8")
    _write_frame(
        bytes([_TAG_BINARY, len(kind_bytes)])
        + kind_bytes
        + bytes([len(id_bytes)])
        + id_bytes
        + bytes(data)
    )


class Switchable:
    """Reversible rebinding of ``name`` on ``parent``.

    The original callable stays reachable through ``original``; nested
    switches restore the previous binding, and only unwinding the outermost
    scope restores the original.
    """

    def __init__(self, parent, name):
        self._parent = parent
        self._name = name
        self._stack = []

    @property
    def original(self):
        if self._stack:
            return self._stack[0]
        return getattr(self._parent, self._name)

    @contextmanager
    def switch_to(self, target):
        self._stack.append(getattr(self._parent, self._name))
        try:
            setattr(self._parent, self._name, target)
            yield self
        finally:
            setattr(self._parent, self._name, self._stack.pop())


_HOOKS = []


def _register_hook(factory):
    _HOOKS.append(factory)
    return factory


@contextmanager
def _hook_scope():
    with ExitStack() as stack:
        for factory in _HOOKS:
            stack.enter_context(factory())
        yield


### CAPTURE HOOKS ###

_namespace = {}


def _collect_imports(tree):
    names = set()
    for node in ast.walk(tree):
        if isinstance(node, ast.Import):
            for alias in node.names:
                names.add(alias.name.split(".")[0])
        elif isinstance(node, ast.ImportFrom):
            if node.level == 0 and node.module:
                names.add(node.module.split(".")[0])
    return sorted(names)


def _exception_frame(exc):
    frame = {
        "kind": "exception",
        "type": "UserCodeError",
        "message": "%s: %s" % (type(exc).__name__, exc),
    }
    if exc.__traceback__ is not None:
        formatted = traceback.format_tb(exc.__traceback__)
        if formatted:
            frame["traceback"] = formatted[-1].strip()
    return frame


def _json_value(value):
    try:
        json.dumps(value)
        return value
    except (TypeError, ValueError):
        return repr(value)


def _read_structured():
    while True:
        body = _read_frame()
        if body is None:
            return None
        if not body or body[0] != _TAG_STRUCTURED:
            continue
        try:
            return json.loads(body[1:].decode("utf-8"))
        except ValueError:
            continue


def _run_code(source):
    try:
        tree = ast.parse(source, filename=_FILENAME)
    except SyntaxError as exc:
        _send_json(_exception_frame(exc))
        _send_json({"kind": "end"})
        return None

    imports = _collect_imports(tree)
    if imports:
        # Report required imports and wait for the broker to finish any
        # installs before executing.
        _send_json({"kind": "requires", "names": imports})
        while True:
            reply = _read_structured()
            if reply is None or reply.get("op") == "exit":
                return "exit"
            if reply.get("op") == "continue":
                break

    to_eval = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        to_eval = ast.Expression(tree.body.pop().value)

    try:
        exec_code = compile(tree, _FILENAME, "exec")
        eval_code = compile(to_eval, _FILENAME, "eval") if to_eval is not None else None
    except Exception as exc:
        _send_json(_exception_frame(exc))
        _send_json({"kind": "end"})
        return None

    value = None
    try:
        with _hook_scope():
            exec(exec_code, _namespace, _namespace)
            if eval_code is not None:
                value = eval(eval_code, _namespace, _namespace)
    except Exception as exc:
        _send_json(_exception_frame(exc))
        _send_json({"kind": "end"})
        return None

    _send_json({"kind": "result", "value": _json_value(value)})
    _send_json({"kind": "end"})
    return None


def _serve():
    _send_json({"kind": "ready"})
    while True:
        request = _read_structured()
        if request is None:
            return
        op = request.get("op")
        if op == "run_code":
            if _run_code(request.get("source", "")) == "exit":
                return
        elif op == "set_env_vars":
            os.environ.update(request.get("vars") or {})
            _send_json({"kind": "result", "value": None})
            _send_json({"kind": "end"})
        elif op == "exit":
            return


if __name__ == "__main__":
    try:
        _serve()
    except KeyboardInterrupt:
        pass
"#;
