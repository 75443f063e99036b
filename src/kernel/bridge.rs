//! 内核端桥接程序
//!
//! 以 `python -u -c PYTHON_KERNEL_BRIDGE [init_file...]` 启动。stdin 接收请求，stdout 输出消息，
//! 均为一行一条 JSON（见 kernel::protocol）。启动后先把协议输出挪到私有 fd，
//! 用户代码的 print 被捕获为 stream 消息，不会污染协议流。
//!
//! 每次 execute_request 依次产生：iopub busy → execute_input → stream / execute_result /
//! display_data（matplotlib 图像）或 error → shell execute_reply → iopub idle。
//! interrupt_request 由读线程处理，向主线程注入 KeyboardInterrupt。

pub const PYTHON_KERNEL_BRIDGE: &str = r##"
import _thread
import ast
import base64
import contextlib
import io
import json
import os
import queue
import sys
import threading
import traceback
import uuid

os.environ.setdefault("MPLBACKEND", "Agg")

_proto = os.fdopen(os.dup(1), "w", buffering=1, encoding="utf-8")
os.dup2(2, 1)

_lock = threading.Lock()
_requests = queue.Queue()
_ns = {"__name__": "__main__", "__builtins__": __builtins__}
_count = 0


def _emit(channel, msg_type, content, parent=None, metadata=None):
    msg = {
        "channel": channel,
        "header": {"msg_id": uuid.uuid4().hex, "msg_type": msg_type},
        "parent_header": (parent or {}).get("header", {}),
        "metadata": metadata or {},
        "content": content,
    }
    line = json.dumps(msg, ensure_ascii=False, default=str)
    with _lock:
        _proto.write(line + "\n")
        _proto.flush()


def _msg_type(req):
    return req.get("header", {}).get("msg_type", "")


def _reader():
    for line in sys.stdin:
        line = line.strip()
        if not line:
            continue
        try:
            req = json.loads(line)
        except ValueError:
            continue
        if _msg_type(req) == "interrupt_request":
            _thread.interrupt_main()
            _emit("control", "interrupt_reply", {"status": "ok"}, req)
            continue
        _requests.put(req)
    _requests.put(None)


def _run(code, filename="<cell>"):
    tree = ast.parse(code, filename, "exec")
    last = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        last = ast.Expression(tree.body.pop().value)
    exec(compile(tree, filename, "exec"), _ns)
    if last is not None:
        return eval(compile(last, filename, "eval"), _ns)
    return None


def _figures():
    plt = sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return []
    images = []
    for num in plt.get_fignums():
        buf = io.BytesIO()
        plt.figure(num).savefig(buf, format="png", bbox_inches="tight")
        images.append(base64.b64encode(buf.getvalue()).decode("ascii"))
    plt.close("all")
    return images


def _format_error(e):
    if isinstance(e, SyntaxError):
        return traceback.format_exception_only(type(e), e)
    tb = e.__traceback__
    for _ in range(2):
        if tb is not None and tb.tb_next is not None:
            tb = tb.tb_next
    return traceback.format_exception(type(e), e, tb)


def _execute(req):
    global _count
    _count += 1
    code = req.get("content", {}).get("code", "")
    _emit("iopub", "status", {"execution_state": "busy"}, req)
    _emit("iopub", "execute_input", {"code": code, "execution_count": _count}, req)

    captured = io.StringIO()
    value = None
    error = None
    try:
        with contextlib.redirect_stdout(captured), contextlib.redirect_stderr(captured):
            value = _run(code)
    except BaseException as e:
        error = {
            "ename": type(e).__name__,
            "evalue": str(e),
            "traceback": _format_error(e),
        }

    text = captured.getvalue()
    if text:
        _emit("iopub", "stream", {"name": "stdout", "text": text}, req)
    if error is None:
        if value is not None:
            _emit(
                "iopub",
                "execute_result",
                {"execution_count": _count, "data": {"text/plain": repr(value)}, "metadata": {}},
                req,
            )
        for png in _figures():
            _emit(
                "iopub",
                "display_data",
                {"data": {"image/png": png, "text/plain": "<Figure>"}, "metadata": {}},
                req,
            )
        status, reply = "ok", {}
    else:
        _emit("iopub", "error", error, req)
        status, reply = "error", dict(error)

    reply.update({"status": status, "execution_count": _count})
    _emit("shell", "execute_reply", reply, req, {"status": status})
    _emit("iopub", "status", {"execution_state": "idle"}, req)


def _kernel_info(req):
    _emit(
        "shell",
        "kernel_info_reply",
        {
            "status": "ok",
            "protocol_version": "5.3",
            "implementation": "wxbot-bridge",
            "language_info": {"name": "python", "version": sys.version.split()[0]},
        },
        req,
    )


def main():
    for path in sys.argv[1:]:
        try:
            with open(path, encoding="utf-8") as f:
                _run(f.read(), path)
        except BaseException:
            traceback.print_exc()

    threading.Thread(target=_reader, daemon=True).start()
    _emit("iopub", "status", {"execution_state": "starting"})

    while True:
        try:
            req = _requests.get()
            if req is None:
                return
            kind = _msg_type(req)
            if kind == "execute_request":
                _execute(req)
            elif kind == "kernel_info_request":
                _kernel_info(req)
            elif kind == "shutdown_request":
                restart = req.get("content", {}).get("restart", False)
                _emit("control", "shutdown_reply", {"status": "ok", "restart": restart}, req)
                return
        except KeyboardInterrupt:
            continue


main()
"##;
