// tests/integration_test.rs

use std::io::Write;

use c4vm::host::{FileSystem, FsError, Host, HostFs};
use c4vm::loader::{self, Image, Patch, PatchKind};
use c4vm::memory::Word;
use c4vm::opcode::OpcodeTable;
use c4vm::printf::Printf;
use c4vm::vm::{Dispatch, Vm, VmConfig, VmError};

/// Everything observable about a finished run.
#[derive(Debug, PartialEq)]
struct Outcome {
    result: Result<i64, String>,
    stdout: String,
    registers: [i64; 4],
    memory: Vec<u8>,
    cycles: u64,
}

/// Assembles instruction names from the standard table and decimal numbers;
/// `WORD` stands for the word size in bytes.
fn asm<W: Word>(source: &str) -> Vec<i64> {
    let table = OpcodeTable::standard();
    source
        .split_whitespace()
        .map(|token| match token {
            "WORD" => W::SIZE as i64,
            _ => table.code_of(token).unwrap_or_else(|| token.parse().unwrap()),
        })
        .collect()
}

/// Loads and runs `image` the way the binary does, with stdout captured.
fn run_image<W: Word>(image: &Image, args: &[&str], dispatch: Dispatch) -> Outcome {
    let config = VmConfig { dispatch, ..VmConfig::default() };
    let mut vm = Vm::<W>::new(OpcodeTable::standard(), config).unwrap();
    let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    loader::load(&mut vm, image, &args).unwrap();

    let mut fs = HostFs::new();
    let mut printf = Printf::new(W::WIDTH);
    let mut out = Vec::new();
    let result = {
        let mut host = Host::new(&mut fs, &mut printf, &mut out);
        vm.run(&mut host)
    };
    Outcome {
        result: result.map(|code| code.to_i64()).map_err(|e: VmError| e.to_string()),
        stdout: String::from_utf8(out).unwrap(),
        registers: [vm.pc.to_i64(), vm.a.to_i64(), vm.bp.to_i64(), vm.sp.to_i64()],
        memory: vm.memory().as_bytes().to_vec(),
        cycles: vm.cycles(),
    }
}

/// int main(int argc, char **argv) {
///     printf("%d args, first %s\n", argc, argv[1]);
///     return argc;
/// }
fn argv_program<W: Word>() -> Image {
    let code = asm::<W>(
        "ENT 0 \
         IMM 0 PSH \
         LEA 3 LI PSH \
         LEA 2 LI PSH IMM WORD ADD LI PSH \
         PRTF ADJ 3 \
         LEA 3 LI LEV",
    );
    Image {
        width: W::WIDTH,
        entry: 0,
        code,
        data: b"%d args, first %s\n\0".to_vec(),
        patches: vec![Patch { kind: PatchKind::Data, index: 3, value: 0 }],
    }
}

/// int main(int argc, char **argv) {
///     int fd;
///     fd = open(argv[1], 0);
///     read(fd, buf, 5);
///     printf("[%s]\n", buf);
///     return close(fd);
/// }
fn cat_program<W: Word>() -> Image {
    let code = asm::<W>(
        "ENT 1 \
         LEA -1 PSH \
         LEA 2 LI PSH IMM WORD ADD LI PSH IMM 0 PSH OPEN ADJ 2 \
         SI \
         LEA -1 LI PSH IMM 0 PSH IMM 5 PSH READ ADJ 3 \
         IMM 0 PSH IMM 0 PSH PRTF ADJ 2 \
         LEA -1 LI PSH CLOS ADJ 1 \
         LEV",
    );
    let mut data = b"[%s]\n\0\0\0".to_vec();
    data.extend_from_slice(&[0; 8]);
    Image {
        width: W::WIDTH,
        entry: 0,
        code,
        data,
        patches: vec![
            Patch { kind: PatchKind::Data, index: 26, value: 8 }, // read buffer
            Patch { kind: PatchKind::Data, index: 35, value: 0 }, // format
            Patch { kind: PatchKind::Data, index: 38, value: 8 }, // printed buffer
        ],
    }
}

// --- Whole Programs ---

#[test]
fn test_main_receives_argc_and_argv() {
    let outcome = run_image::<i32>(&argv_program::<i32>(), &["prog", "hello"], Dispatch::Specialized);
    assert_eq!(outcome.stdout, "2 args, first hello\n");
    assert_eq!(outcome.result, Ok(2));

    let outcome = run_image::<i64>(&argv_program::<i64>(), &["prog", "world", "x"], Dispatch::Table);
    assert_eq!(outcome.stdout, "3 args, first world\n");
    assert_eq!(outcome.result, Ok(3));
}

#[test]
fn test_dispatch_strategies_agree() {
    let table = run_image::<i32>(&argv_program::<i32>(), &["prog", "same"], Dispatch::Table);
    let specialized =
        run_image::<i32>(&argv_program::<i32>(), &["prog", "same"], Dispatch::Specialized);
    assert_eq!(table, specialized);

    let table = run_image::<i64>(&argv_program::<i64>(), &["prog", "same"], Dispatch::Table);
    let specialized =
        run_image::<i64>(&argv_program::<i64>(), &["prog", "same"], Dispatch::Specialized);
    assert_eq!(table, specialized);
}

#[test]
fn test_read_file_through_syscalls() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"hello world").unwrap();
    let path = file.path().to_str().unwrap();

    for dispatch in [Dispatch::Table, Dispatch::Specialized] {
        let outcome = run_image::<i32>(&cat_program::<i32>(), &["cat", path], dispatch);
        assert_eq!(outcome.stdout, "[hello]\n");
        assert_eq!(outcome.result, Ok(0));

        let outcome = run_image::<i64>(&cat_program::<i64>(), &["cat", path], dispatch);
        assert_eq!(outcome.stdout, "[hello]\n");
        assert_eq!(outcome.result, Ok(0));
    }
}

#[test]
fn test_runtime_fault_reports_error() {
    // main() { return 1 / 0; }
    let code = asm::<i64>("ENT 0 IMM 1 PSH IMM 0 DIV LEV");
    let image = Image::new(c4vm::Width::W64, code);
    let outcome = run_image::<i64>(&image, &["prog"], Dispatch::Table);
    assert_eq!(outcome.result, Err("division by zero at pc 0x38".to_string()));
}

// --- Host File System ---

#[test]
fn test_host_fs_reads_sequentially() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"abcdefgh").unwrap();
    let path = file.path().to_str().unwrap();

    let mut fs = HostFs::new();
    let fd = fs.open(path, 0);
    assert_eq!(fd, 0);
    assert_eq!(fs.read(fd, 3).unwrap(), b"abc");
    assert_eq!(fs.read(fd, 10).unwrap(), b"defgh");
    assert_eq!(fs.read(fd, 10).unwrap(), b"");

    // Descriptors are not reused.
    let second = fs.open(path, 0);
    assert_eq!(second, 1);
    assert_eq!(fs.open_handles(), 2);

    fs.close(fd).unwrap();
    assert_eq!(fs.read(fd, 1), Err(FsError::BadHandle(0)));
    assert_eq!(fs.close(fd), Err(FsError::BadHandle(0)));
    assert_eq!(fs.open_handles(), 1);
}

#[test]
fn test_host_fs_rejects_missing_files_and_writes() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap();

    let mut fs = HostFs::new();
    assert!(fs.open("/nonexistent/c4vm/input.c", 0) < 0);
    assert!(fs.open(path, libc::O_WRONLY) < 0);
    assert_eq!(fs.open_handles(), 0);
}
